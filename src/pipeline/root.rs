//! The root stage (spec.md §4.8): the terminal upward handler. It owns no
//! transport itself — "owns the transport pointer" in the spec means it is
//! the stage the client facade reaches through to observe connection
//! state and inbound domain events — and converts pipeline events into the
//! client-visible callbacks [`crate::client::DeviceClient`] registers,
//! always dispatched on the callback executor per spec.md §5.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::event::{Event, PipelineErrorSnapshot};
use crate::pipeline::executor::Executor;
use crate::pipeline::{PipelineLink, Stage};

type ConnectionStateCallback = Box<dyn Fn(bool) + Send + Sync>;
type C2DCallback = Box<dyn Fn(Vec<u8>, Vec<(String, String)>) + Send + Sync>;
type InputCallback = Box<dyn Fn(String, Vec<u8>, Vec<(String, String)>) + Send + Sync>;
type MethodRequestCallback = Box<dyn Fn(String, String, Vec<u8>) + Send + Sync>;
type DesiredPropertiesCallback = Box<dyn Fn(u64, Value) + Send + Sync>;
type RegistrationResponseCallback = Box<dyn Fn(String, u16, Vec<(String, Vec<String>)>, Vec<u8>) + Send + Sync>;
type DisconnectedCallback = Box<dyn Fn(PipelineErrorSnapshot) + Send + Sync>;

/// Observer callbacks the client facade installs. All are optional — a
/// client that only sends telemetry never registers `on_c2d_message`.
#[derive(Default)]
pub struct RootObservers {
    pub on_connection_state_changed: Option<ConnectionStateCallback>,
    pub on_c2d_message: Option<C2DCallback>,
    pub on_input_message: Option<InputCallback>,
    pub on_method_request: Option<MethodRequestCallback>,
    pub on_desired_properties_updated: Option<DesiredPropertiesCallback>,
    pub on_registration_response: Option<RegistrationResponseCallback>,
    pub on_disconnected_unexpected: Option<DisconnectedCallback>,
}

pub struct RootStage {
    observers: Arc<Mutex<RootObservers>>,
    callback_executor: Arc<Executor>,
}

impl RootStage {
    pub fn new(callback_executor: Arc<Executor>) -> Arc<RootStage> {
        Arc::new(RootStage {
            observers: Arc::new(Mutex::new(RootObservers::default())),
            callback_executor,
        })
    }

    pub fn set_observers(&self, observers: RootObservers) {
        *self.observers.lock().expect("root observers mutex poisoned") = observers;
    }

    pub fn on_connection_state_changed(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.observers.lock().expect("root observers mutex poisoned").on_connection_state_changed = Some(Box::new(callback));
    }

    pub fn on_c2d_message(&self, callback: impl Fn(Vec<u8>, Vec<(String, String)>) + Send + Sync + 'static) {
        self.observers.lock().expect("root observers mutex poisoned").on_c2d_message = Some(Box::new(callback));
    }

    pub fn on_input_message(&self, callback: impl Fn(String, Vec<u8>, Vec<(String, String)>) + Send + Sync + 'static) {
        self.observers.lock().expect("root observers mutex poisoned").on_input_message = Some(Box::new(callback));
    }

    pub fn on_method_request(&self, callback: impl Fn(String, String, Vec<u8>) + Send + Sync + 'static) {
        self.observers.lock().expect("root observers mutex poisoned").on_method_request = Some(Box::new(callback));
    }

    pub fn on_desired_properties_updated(&self, callback: impl Fn(u64, Value) + Send + Sync + 'static) {
        self.observers.lock().expect("root observers mutex poisoned").on_desired_properties_updated = Some(Box::new(callback));
    }

    pub fn on_registration_response(
        &self,
        callback: impl Fn(String, u16, Vec<(String, Vec<String>)>, Vec<u8>) + Send + Sync + 'static,
    ) {
        self.observers.lock().expect("root observers mutex poisoned").on_registration_response = Some(Box::new(callback));
    }

    pub fn on_disconnected_unexpected(&self, callback: impl Fn(PipelineErrorSnapshot) + Send + Sync + 'static) {
        self.observers.lock().expect("root observers mutex poisoned").on_disconnected_unexpected = Some(Box::new(callback));
    }
}

impl Stage for RootStage {
    fn name(&self) -> &'static str {
        "Root"
    }

    fn handle_event(&self, event: Event, _link: PipelineLink) {
        let observers = self.observers.clone();
        self.callback_executor.run(move || {
            let observers = observers.lock().expect("root observers mutex poisoned");
            dispatch(&observers, event);
        });
    }
}

fn dispatch(observers: &RootObservers, event: Event) {
    match event {
        Event::ConnectedChanged { connected } => {
            if let Some(cb) = &observers.on_connection_state_changed {
                cb(connected);
            }
        }
        Event::IncomingC2DMessage { payload, properties } => {
            if let Some(cb) = &observers.on_c2d_message {
                cb(payload, properties.into_iter().collect());
            } else {
                log::debug!("C2D message received but no handler is registered; dropping");
            }
        }
        Event::IncomingInputMessage {
            input_name,
            payload,
            properties,
        } => {
            if let Some(cb) = &observers.on_input_message {
                cb(input_name, payload, properties.into_iter().collect());
            } else {
                log::debug!("input message received but no handler is registered; dropping");
            }
        }
        Event::IncomingMethodRequest {
            request_id,
            method_name,
            payload,
        } => {
            if let Some(cb) = &observers.on_method_request {
                cb(request_id, method_name, payload);
            } else {
                log::warn!("method request `{method_name}` received but no handler is registered; dropping");
            }
        }
        Event::DesiredPropertiesUpdated { version, patch } => {
            if let Some(cb) = &observers.on_desired_properties_updated {
                cb(version, patch);
            } else {
                log::debug!("desired properties update received but no handler is registered; dropping");
            }
        }
        Event::RegistrationResponse {
            request_id,
            status_code,
            key_values,
            payload,
        } => {
            if let Some(cb) = &observers.on_registration_response {
                cb(request_id, status_code, key_values.into_iter().collect(), payload);
            } else {
                log::debug!("registration response received but no handler is registered; dropping");
            }
        }
        Event::DisconnectedUnexpected { error } => {
            if let Some(cb) = &observers.on_disconnected_unexpected {
                cb(error);
            } else {
                log::warn!("unexpected disconnect with no handler registered: {error:?}");
            }
        }
        Event::IncomingMqttMessage { topic, .. } => {
            // A converter stage failed to classify this topic; nothing
            // further up the chain understands raw MQTT. Dropped, not
            // raised, per spec.md §4.2.
            log::warn!("unrecognized inbound MQTT message reached the root stage on topic `{topic}`; dropping");
        }
    }
}
