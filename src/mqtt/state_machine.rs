//! The connect/disconnect/reconnect/submit-action state machine, per
//! spec.md §4.5. Grounded in the teacher's `iothub/mod.rs` connection
//! lifecycle and `iothub/eventloop.rs`'s state tracking, generalized from
//! the teacher's single always-reconnecting loop into the explicit
//! four-state machine the spec requires.

use std::collections::VecDeque;

use crate::errors::PipelineError;
use crate::operation::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A queued action awaiting drain once the connection comes up: a publish,
/// subscribe, or unsubscribe operation, held whole so its completion
/// callback travels with it.
pub struct PendingAction {
    pub operation: Operation,
}

/// Effects the caller (the `MQTTClient` stage) must perform in response to
/// a trigger — the state machine itself never touches the transport.
pub enum Effect {
    None,
    CallConnect,
    CallReconnect,
    CallDisconnect,
    /// Drain the pending queue, handing each action to the transport in
    /// FIFO order.
    Drain(Vec<PendingAction>),
    /// `submit-action` while disconnecting: fails immediately per spec.md
    /// §4.5's state table ("disconnecting: — (fails a)").
    FailImmediately(Operation),
}

/// The MQTT connection state machine described in spec.md §4.5. Holds no
/// transport reference; every transition returns an [`Effect`] describing
/// what the caller must do, keeping the machine itself trivially testable.
pub struct ConnectionStateMachine {
    state: ConnectionState,
    pending: VecDeque<PendingAction>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        ConnectionStateMachine {
            state: ConnectionState::Disconnected,
            pending: VecDeque::new(),
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connect(&mut self) -> Effect {
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                Effect::CallConnect
            }
            _ => Effect::None,
        }
    }

    pub fn disconnect(&mut self) -> Effect {
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Disconnecting;
                Effect::CallDisconnect
            }
            _ => Effect::None,
        }
    }

    pub fn reconnect(&mut self) -> Effect {
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Connecting;
                Effect::CallReconnect
            }
            _ => Effect::None,
        }
    }

    /// The transport reported `on_connected`.
    pub fn transport_connected(&mut self) -> Effect {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            let drained: Vec<PendingAction> = self.pending.drain(..).collect();
            return Effect::Drain(drained);
        }
        Effect::None
    }

    /// The transport reported `on_disconnected`.
    pub fn transport_disconnected(&mut self) -> Effect {
        self.state = ConnectionState::Disconnected;
        Effect::None
    }

    /// Submit a publish/subscribe/unsubscribe action, per spec.md §4.5's
    /// `submit-action` row.
    pub fn submit_action(&mut self, operation: Operation) -> Effect {
        match self.state {
            ConnectionState::Disconnected => {
                self.pending.push_back(PendingAction { operation });
                self.state = ConnectionState::Connecting;
                Effect::CallConnect
            }
            ConnectionState::Connecting => {
                self.pending.push_back(PendingAction { operation });
                Effect::None
            }
            ConnectionState::Connected => {
                self.pending.push_back(PendingAction { operation });
                let drained: Vec<PendingAction> = self.pending.drain(..).collect();
                Effect::Drain(drained)
            }
            ConnectionState::Disconnecting => Effect::FailImmediately(operation),
        }
    }
}

pub fn not_connected_error() -> PipelineError {
    PipelineError::NotConnected("MQTT connection is disconnecting".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Operation, OperationKind};

    fn noop_operation() -> Operation {
        Operation::new(
            OperationKind::MqttPublish {
                topic: "t".to_string(),
                payload: vec![],
            },
            Box::new(|_| {}),
        )
    }

    #[test]
    fn connect_from_disconnected_calls_transport() {
        let mut sm = ConnectionStateMachine::default();
        assert!(matches!(sm.connect(), Effect::CallConnect));
        assert_eq!(sm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn connect_while_connecting_is_noop() {
        let mut sm = ConnectionStateMachine::default();
        sm.connect();
        assert!(matches!(sm.connect(), Effect::None));
    }

    #[test]
    fn submit_action_while_disconnected_enqueues_and_connects() {
        let mut sm = ConnectionStateMachine::default();
        let effect = sm.submit_action(noop_operation());
        assert!(matches!(effect, Effect::CallConnect));
        assert_eq!(sm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn submit_action_while_connecting_just_enqueues() {
        let mut sm = ConnectionStateMachine::default();
        sm.connect();
        let effect = sm.submit_action(noop_operation());
        assert!(matches!(effect, Effect::None));
    }

    #[test]
    fn transport_connected_drains_pending_queue_in_order() {
        let mut sm = ConnectionStateMachine::default();
        sm.submit_action(noop_operation());
        sm.submit_action(noop_operation());
        let Effect::Drain(drained) = sm.transport_connected() else {
            panic!("expected a drain effect");
        };
        assert_eq!(drained.len(), 2);
        assert_eq!(sm.state(), ConnectionState::Connected);
    }

    #[test]
    fn submit_action_while_connected_drains_immediately() {
        let mut sm = ConnectionStateMachine::default();
        sm.connect();
        sm.transport_connected();
        let effect = sm.submit_action(noop_operation());
        assert!(matches!(effect, Effect::Drain(_)));
    }

    #[test]
    fn submit_action_while_disconnecting_fails_immediately() {
        let mut sm = ConnectionStateMachine::default();
        sm.connect();
        sm.transport_connected();
        sm.disconnect();
        assert_eq!(sm.state(), ConnectionState::Disconnecting);
        let effect = sm.submit_action(noop_operation());
        assert!(matches!(effect, Effect::FailImmediately(_)));
    }

    #[test]
    fn transport_disconnected_always_returns_to_disconnected() {
        let mut sm = ConnectionStateMachine::default();
        sm.connect();
        sm.transport_connected();
        sm.disconnect();
        sm.transport_disconnected();
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_only_applies_when_connected() {
        let mut sm = ConnectionStateMachine::default();
        assert!(matches!(sm.reconnect(), Effect::None));
        sm.connect();
        sm.transport_connected();
        assert!(matches!(sm.reconnect(), Effect::CallReconnect));
        assert_eq!(sm.state(), ConnectionState::Connecting);
    }
}
