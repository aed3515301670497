//! Black-box test of the IoT Hub MQTT pipeline's connect/telemetry/disconnect
//! path against a fake bottom stage standing in for `MQTTClient` + the real
//! wire transport, covering the S1/S2 scenarios: a `SendTelemetry` before any
//! `Connect` still reaches the fake transport with the right topic and
//! payload, and operations resolve successfully end to end.

use std::sync::{Arc, Mutex};

use iothub_device_client::auth::SymmetricKeyAuthProvider;
use iothub_device_client::operation::{Message, Operation, OperationKind};
use iothub_device_client::pipeline::auth_stage::{Domain, UseAuthProvider};
use iothub_device_client::pipeline::iothub_converter::IoTHubMQTTConverter;
use iothub_device_client::pipeline::root::RootStage;
use iothub_device_client::pipeline::{Pipeline, PipelineLink, Stage};
use iothub_device_client::pipeline::executor::Executor;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Connect { username: String },
    Publish { topic: String, payload: Vec<u8> },
    Disconnect,
}

struct FakeTransport {
    calls: Mutex<Vec<Call>>,
}

impl FakeTransport {
    fn new() -> Arc<FakeTransport> {
        Arc::new(FakeTransport {
            calls: Mutex::new(Vec::new()),
        })
    }
}

impl Stage for FakeTransport {
    fn name(&self) -> &'static str {
        "FakeTransport"
    }

    fn run_op(&self, op: Operation, _link: PipelineLink) {
        match &op.kind {
            OperationKind::SetMqttConnectionArgs(args) => {
                self.calls.lock().unwrap().push(Call::Connect {
                    username: args.username.clone(),
                });
                op.succeed();
            }
            OperationKind::Connect => op.succeed(),
            OperationKind::MqttPublish { topic, payload } => {
                self.calls.lock().unwrap().push(Call::Publish {
                    topic: topic.clone(),
                    payload: payload.clone(),
                });
                op.succeed();
            }
            OperationKind::Disconnect => {
                self.calls.lock().unwrap().push(Call::Disconnect);
                op.succeed();
            }
            _ => op.succeed(),
        }
    }
}

fn submit(pipeline: &Pipeline, kind: OperationKind) -> bool {
    let (tx, rx) = std::sync::mpsc::channel();
    let op = Operation::new(kind, Box::new(move |r| tx.send(r.is_ok()).unwrap()));
    pipeline.submit(op);
    rx.recv().unwrap()
}

#[test]
fn connect_publish_disconnect_round_trip() {
    let callback_executor = Arc::new(Executor::spawn("test-callback"));
    let root = RootStage::new(callback_executor);
    let transport = FakeTransport::new();
    let pipeline = Pipeline::new(vec![
        root,
        UseAuthProvider::new(Domain::IoTHub),
        IoTHubMQTTConverter::new(),
        transport.clone(),
    ]);

    let provider = Arc::new(SymmetricKeyAuthProvider::new(
        "d".to_string(),
        None,
        "h.example".to_string(),
        "Zm9vYmFy".to_string(),
    ));
    assert!(submit(&pipeline, OperationKind::SetAuthProvider(provider)));
    assert!(submit(&pipeline, OperationKind::Connect));
    assert!(submit(
        &pipeline,
        OperationKind::SendTelemetry(Message {
            body: b"x".to_vec(),
            message_id: Some("m1".to_string()),
            ..Default::default()
        })
    ));
    assert!(submit(&pipeline, OperationKind::Disconnect));

    let calls = transport.calls.lock().unwrap().clone();
    assert!(matches!(calls[0], Call::Connect { .. }));
    match &calls[1] {
        Call::Publish { topic, payload } => {
            assert_eq!(topic, "devices/d/messages/events/%24.mid=m1");
            assert_eq!(payload, b"x");
        }
        other => panic!("expected a publish, got {other:?}"),
    }
    assert_eq!(calls[2], Call::Disconnect);
}

#[test]
fn enabling_an_unknown_feature_fails_with_invalid_argument() {
    let callback_executor = Arc::new(Executor::spawn("test-callback-2"));
    let root = RootStage::new(callback_executor);
    let transport = FakeTransport::new();
    let pipeline = Pipeline::new(vec![
        root,
        UseAuthProvider::new(Domain::IoTHub),
        IoTHubMQTTConverter::new(),
        transport,
    ]);

    let provider = Arc::new(SymmetricKeyAuthProvider::new(
        "d".to_string(),
        None,
        "h.example".to_string(),
        "Zm9vYmFy".to_string(),
    ));
    assert!(submit(&pipeline, OperationKind::SetAuthProvider(provider)));
    assert!(!submit(
        &pipeline,
        OperationKind::EnableFeature("bogus".to_string())
    ));
}
