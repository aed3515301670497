//! Black-box test of the DPS registration round trip (spec.md §8 S5):
//! a registration request publishes to the right topic and an injected
//! response on the DPS response topic resolves into a `RegistrationResponse`
//! event with the request id, status, and key-values the response topic
//! encodes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use iothub_device_client::event::Event;
use iothub_device_client::operation::{Operation, OperationKind, SecurityClientArgs};
use iothub_device_client::pipeline::executor::Executor;
use iothub_device_client::pipeline::provisioning_converter::ProvisioningMQTTConverter;
use iothub_device_client::pipeline::root::RootStage;
use iothub_device_client::pipeline::{Pipeline, PipelineLink, Stage};

struct FakeTransport;

impl Stage for FakeTransport {
    fn name(&self) -> &'static str {
        "FakeTransport"
    }

    fn run_op(&self, op: Operation, _link: PipelineLink) {
        op.succeed();
    }
}

#[test]
fn registration_response_round_trip() {
    let callback_executor = Arc::new(Executor::spawn("dps-callback"));
    let root = RootStage::new(callback_executor);

    let response = Arc::new(Mutex::new(None));
    let response2 = response.clone();
    root.on_registration_response(move |request_id, status_code, key_values, payload| {
        *response2.lock().unwrap() = Some((request_id, status_code, key_values, payload));
    });

    let converter = ProvisioningMQTTConverter::new();
    let pipeline = Pipeline::new(vec![root, converter, Arc::new(FakeTransport)]);

    let (tx, rx) = std::sync::mpsc::channel();
    let op = Operation::new(
        OperationKind::SetSecurityClientArgs(SecurityClientArgs {
            id_scope: "0ne00000".to_string(),
            registration_id: "dev1".to_string(),
            provisioning_host: "global.x".to_string(),
        }),
        Box::new(move |r| tx.send(r.is_ok()).unwrap()),
    );
    pipeline.submit(op);
    assert!(rx.recv().unwrap());

    pipeline.inject_event_at_bottom(Event::IncomingMqttMessage {
        topic: "$dps/registrations/res/200/?$rid=r1&retry-after=3".to_string(),
        payload: b"{\"status\":\"assigned\"}".to_vec(),
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while response.lock().unwrap().is_none() {
        if std::time::Instant::now() > deadline {
            panic!("registration response never reached the callback");
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let (request_id, status_code, key_values, payload) = response.lock().unwrap().take().unwrap();
    assert_eq!(request_id, "r1");
    assert_eq!(status_code, 200);
    assert_eq!(
        key_values.iter().find(|(k, _)| k == "rid").map(|(_, v)| v.clone()),
        Some(vec!["r1".to_string()])
    );
    assert_eq!(
        key_values.iter().find(|(k, _)| k == "retry-after").map(|(_, v)| v.clone()),
        Some(vec!["3".to_string()])
    );
    assert_eq!(payload, b"{\"status\":\"assigned\"}");
}
