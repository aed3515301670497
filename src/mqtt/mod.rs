//! MQTT protocol plumbing: topic shapes, the connection state machine, the
//! `rumqttc` transport adapter, and the stage that ties all three together.

pub mod client_stage;
pub mod state_machine;
pub mod topics;
pub mod transport;

pub use client_stage::MQTTClient;
