//! `MQTTClient` (spec.md §4.4): the bottom-most stage of an MQTT pipeline.
//! Bridges [`ConnectionStateMachine`] transitions to real
//! [`MqttTransport`] calls and forwards inbound packets up as
//! `Event::IncomingMqttMessage`. Grounded in the teacher's
//! `connection/mod.rs` (the thing above the wire) and `iothub/mod.rs`'s
//! `connect_iothub`/reconnect loop, split here into an explicit state
//! machine plus a thin stage instead of one big retrying function.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::errors::PipelineError;
use crate::event::{Event, PipelineErrorSnapshot};
use crate::mqtt::state_machine::{ConnectionStateMachine, Effect, PendingAction};
use crate::mqtt::transport::{AckCallback, MqttTransport, MqttTransportConfig, TransportEvent};
use crate::operation::{ClientCertificate, Operation, OperationKind, OperationResponse};
use crate::pipeline::{PipelineLink, Stage};

const MQTT_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Clone, Default)]
struct PendingConfig {
    client_id: String,
    hostname: String,
    username: String,
    ca_cert: Option<Vec<u8>>,
    client_cert: Option<ClientCertificate>,
}

pub struct MQTTClient {
    self_ref: Weak<MQTTClient>,
    state_machine: Mutex<ConnectionStateMachine>,
    transport: Mutex<Option<Arc<MqttTransport>>>,
    config: Mutex<Option<PendingConfig>>,
    password: Mutex<String>,
    pending_connect: Mutex<Option<Operation>>,
    link: Mutex<Option<PipelineLink>>,
}

impl MQTTClient {
    pub fn new() -> Arc<MQTTClient> {
        Arc::new_cyclic(|self_ref| MQTTClient {
            self_ref: self_ref.clone(),
            state_machine: Mutex::new(ConnectionStateMachine::default()),
            transport: Mutex::new(None),
            config: Mutex::new(None),
            password: Mutex::new(String::new()),
            pending_connect: Mutex::new(None),
            link: Mutex::new(None),
        })
    }

    fn me(&self) -> Arc<MQTTClient> {
        self.self_ref
            .upgrade()
            .expect("MQTTClient dropped while a callback still held a weak reference to it")
    }

    fn remember_link(&self, link: &PipelineLink) {
        *self.link.lock().expect("link mutex poisoned") = Some(link.clone());
    }

    fn emit(&self, event: Event) {
        let link = self.link.lock().expect("link mutex poisoned").clone();
        match link {
            Some(link) => link.emit_event(event),
            None => log::error!("MQTTClient raised an event before ever processing an operation; dropping"),
        }
    }

    fn start_connect(&self, op: Operation) {
        let Some(config) = self.config.lock().expect("config mutex poisoned").clone() else {
            return op.fail(PipelineError::InvalidArgument(
                "no MQTT connection args set before connecting".to_string(),
            ));
        };
        let password = self.password.lock().expect("password mutex poisoned").clone();
        *self.pending_connect.lock().expect("pending connect mutex poisoned") = Some(op);

        let me = self.me();
        tokio::task::spawn_local(async move {
            let transport_config = MqttTransportConfig {
                client_id: config.client_id,
                hostname: config.hostname,
                port: MQTT_PORT,
                username: config.username,
                ca_cert: config.ca_cert,
                client_cert: config.client_cert,
                keep_alive: KEEP_ALIVE,
            };
            match MqttTransport::connect(&transport_config, password) {
                Ok((transport, mut events)) => {
                    *me.transport.lock().expect("transport mutex poisoned") = Some(Arc::new(transport));
                    while let Some(event) = events.recv().await {
                        me.handle_transport_event(event);
                    }
                }
                Err(e) => {
                    let op = me.pending_connect.lock().expect("pending connect mutex poisoned").take();
                    if let Some(op) = op {
                        op.fail(e);
                    }
                }
            }
        });
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let effect = self
                    .state_machine
                    .lock()
                    .expect("state machine mutex poisoned")
                    .transport_connected();
                if let Some(op) = self.pending_connect.lock().expect("pending connect mutex poisoned").take() {
                    op.succeed();
                }
                self.emit(Event::ConnectedChanged { connected: true });
                if let Effect::Drain(actions) = effect {
                    self.drain(actions);
                }
            }
            TransportEvent::Disconnected { reason } => {
                *self.transport.lock().expect("transport mutex poisoned") = None;
                self.state_machine
                    .lock()
                    .expect("state machine mutex poisoned")
                    .transport_disconnected();
                let pending = self.pending_connect.lock().expect("pending connect mutex poisoned").take();
                match pending {
                    Some(op) => op.fail(reason),
                    None => {
                        let snapshot = PipelineErrorSnapshot::from(&reason);
                        self.emit(Event::ConnectedChanged { connected: false });
                        self.emit(Event::DisconnectedUnexpected { error: snapshot });
                    }
                }
            }
            TransportEvent::MessageReceived { topic, payload } => {
                self.emit(Event::IncomingMqttMessage { topic, payload });
            }
        }
    }

    fn drain(&self, actions: Vec<PendingAction>) {
        for action in actions {
            self.perform_action(action.operation);
        }
    }

    fn perform_action(&self, op: Operation) {
        let transport = self.transport.lock().expect("transport mutex poisoned").clone();
        let Some(transport) = transport else {
            return op.fail(crate::mqtt::state_machine::not_connected_error());
        };

        enum Action {
            Publish { topic: String, payload: Vec<u8> },
            Subscribe { topic: String, qos: u8 },
            Unsubscribe { topic: String },
            NotAnAction,
        }

        let action = match &op.kind {
            OperationKind::MqttPublish { topic, payload } => Action::Publish {
                topic: topic.clone(),
                payload: payload.clone(),
            },
            OperationKind::MqttSubscribe { topic, qos } => Action::Subscribe {
                topic: topic.clone(),
                qos: *qos,
            },
            OperationKind::MqttUnsubscribe(topic) => Action::Unsubscribe { topic: topic.clone() },
            _ => Action::NotAnAction,
        };

        let holder = Arc::new(Mutex::new(Some(op)));
        let completer = holder.clone();
        let callback: AckCallback = Box::new(move |outcome| {
            if let Some(op) = completer.lock().expect("op holder mutex poisoned").take() {
                let result: Result<(), PipelineError> = outcome.into();
                op.complete(result.map(|_| OperationResponse::None));
            }
        });

        match action {
            Action::Publish { topic, payload } => {
                tokio::task::spawn_local(async move {
                    if let Err(e) = transport.publish(topic, payload, callback).await {
                        if let Some(op) = holder.lock().expect("op holder mutex poisoned").take() {
                            op.fail(e);
                        }
                    }
                });
            }
            Action::Subscribe { topic, qos } => {
                tokio::task::spawn_local(async move {
                    if let Err(e) = transport.subscribe(topic, qos, callback).await {
                        if let Some(op) = holder.lock().expect("op holder mutex poisoned").take() {
                            op.fail(e);
                        }
                    }
                });
            }
            Action::Unsubscribe { topic } => {
                tokio::task::spawn_local(async move {
                    if let Err(e) = transport.unsubscribe(topic, callback).await {
                        if let Some(op) = holder.lock().expect("op holder mutex poisoned").take() {
                            op.fail(e);
                        }
                    }
                });
            }
            Action::NotAnAction => {
                if let Some(op) = holder.lock().expect("op holder mutex poisoned").take() {
                    op.fail(PipelineError::Fatal(
                        "a non-MQTT operation reached the connection state machine's action queue".to_string(),
                    ));
                }
            }
        }
    }
}

impl Stage for MQTTClient {
    fn name(&self) -> &'static str {
        "MQTTClient"
    }

    fn run_op(&self, op: Operation, link: PipelineLink) {
        self.remember_link(&link);

        match &op.kind {
            OperationKind::SetMqttConnectionArgs(args) => {
                *self.config.lock().expect("config mutex poisoned") = Some(PendingConfig {
                    client_id: args.client_id.clone(),
                    hostname: args.hostname.clone(),
                    username: args.username.clone(),
                    ca_cert: args.ca_cert.clone(),
                    client_cert: args.client_cert.clone(),
                });
                op.succeed();
            }

            OperationKind::SetSasToken(token) => {
                *self.password.lock().expect("password mutex poisoned") = token.clone();
                op.succeed();
            }

            OperationKind::Connect => {
                let effect = self.state_machine.lock().expect("state machine mutex poisoned").connect();
                match effect {
                    Effect::CallConnect => self.start_connect(op),
                    _ => op.succeed(),
                }
            }

            OperationKind::Disconnect => {
                let effect = self.state_machine.lock().expect("state machine mutex poisoned").disconnect();
                match effect {
                    Effect::CallDisconnect => {
                        let transport = self.transport.lock().expect("transport mutex poisoned").clone();
                        let me = self.me();
                        tokio::task::spawn_local(async move {
                            let result = match &transport {
                                Some(t) => t.disconnect().await,
                                None => Ok(()),
                            };
                            *me.transport.lock().expect("transport mutex poisoned") = None;
                            me.state_machine
                                .lock()
                                .expect("state machine mutex poisoned")
                                .transport_disconnected();
                            me.emit(Event::ConnectedChanged { connected: false });
                            op.complete(result.map(|_| OperationResponse::None));
                        });
                    }
                    _ => op.succeed(),
                }
            }

            OperationKind::Reconnect => {
                let effect = self.state_machine.lock().expect("state machine mutex poisoned").reconnect();
                match effect {
                    Effect::CallReconnect => {
                        let transport = self.transport.lock().expect("transport mutex poisoned").take();
                        let me = self.me();
                        tokio::task::spawn_local(async move {
                            if let Some(t) = &transport {
                                let _ = t.disconnect().await;
                            }
                            me.start_connect(op);
                        });
                    }
                    _ => op.succeed(),
                }
            }

            OperationKind::MqttPublish { .. } | OperationKind::MqttSubscribe { .. } | OperationKind::MqttUnsubscribe(_) => {
                let effect = self
                    .state_machine
                    .lock()
                    .expect("state machine mutex poisoned")
                    .submit_action(op);
                match effect {
                    Effect::None => {}
                    Effect::CallConnect => {
                        // `submit_action` already queued the action; the
                        // connect we kick off here will drain it once
                        // `transport_connected` fires.
                        let probe = Operation::new(OperationKind::Connect, Box::new(|_| {}));
                        self.start_connect(probe);
                    }
                    Effect::Drain(actions) => self.drain(actions),
                    Effect::FailImmediately(op) => op.fail(crate::mqtt::state_machine::not_connected_error()),
                    Effect::CallDisconnect | Effect::CallReconnect => unreachable!(
                        "submit_action never returns a connect-lifecycle effect"
                    ),
                }
            }

            _ => link.forward(op),
        }
    }
}
