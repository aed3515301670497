//! Black-box tests of inbound-message dispatch (C2D messages, direct
//! methods, desired-property pushes) and the twin GET/PATCH request/response
//! correlation, driven against a fake bottom stage standing in for
//! `MQTTClient`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use iothub_device_client::event::Event;
use iothub_device_client::operation::{IoTHubConnectionArgs, Operation, OperationKind, OperationResponse};
use iothub_device_client::pipeline::executor::Executor;
use iothub_device_client::pipeline::iothub_converter::IoTHubMQTTConverter;
use iothub_device_client::pipeline::root::RootStage;
use iothub_device_client::pipeline::{Pipeline, PipelineLink, Stage};

struct FakeTransport {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeTransport {
    fn new() -> Arc<FakeTransport> {
        Arc::new(FakeTransport {
            published: Mutex::new(Vec::new()),
        })
    }
}

impl Stage for FakeTransport {
    fn name(&self) -> &'static str {
        "FakeTransport"
    }

    fn run_op(&self, op: Operation, _link: PipelineLink) {
        match &op.kind {
            OperationKind::MqttPublish { topic, payload } => {
                self.published.lock().unwrap().push((topic.clone(), payload.clone()));
                op.succeed();
            }
            _ => op.succeed(),
        }
    }
}

fn connected_iothub_pipeline() -> (Pipeline, Arc<FakeTransport>, Arc<Executor>) {
    let callback_executor = Arc::new(Executor::spawn("c2d-twins-callback"));
    let root = RootStage::new(callback_executor.clone());
    let transport = FakeTransport::new();
    let converter = IoTHubMQTTConverter::new();
    let pipeline = Pipeline::new(vec![root, converter, transport.clone()]);

    let (tx, rx) = std::sync::mpsc::channel();
    let op = Operation::new(
        OperationKind::SetIoTHubConnectionArgs(IoTHubConnectionArgs {
            device_id: "d".to_string(),
            module_id: None,
            hostname: "h.example".to_string(),
            gateway_hostname: None,
            ca_cert: None,
            sas_token: None,
            client_cert: None,
        }),
        Box::new(move |r| tx.send(r.is_ok()).unwrap()),
    );
    pipeline.submit(op);
    assert!(rx.recv().unwrap());

    (pipeline, transport, callback_executor)
}

#[test]
fn c2d_message_reaches_the_registered_callback() {
    let callback_executor = Arc::new(Executor::spawn("c2d-direct"));
    let root = RootStage::new(callback_executor.clone());
    let received = Arc::new(Mutex::new(None));
    let received2 = received.clone();
    root.on_c2d_message(move |payload, properties| {
        *received2.lock().unwrap() = Some((payload, properties));
    });
    let converter = IoTHubMQTTConverter::new();
    let transport = FakeTransport::new();
    let pipeline = Pipeline::new(vec![root, converter, transport]);

    let (tx, rx) = std::sync::mpsc::channel();
    let op = Operation::new(
        OperationKind::SetIoTHubConnectionArgs(IoTHubConnectionArgs {
            device_id: "d".to_string(),
            module_id: None,
            hostname: "h.example".to_string(),
            gateway_hostname: None,
            ca_cert: None,
            sas_token: None,
            client_cert: None,
        }),
        Box::new(move |r| tx.send(r.is_ok()).unwrap()),
    );
    pipeline.submit(op);
    assert!(rx.recv().unwrap());

    pipeline.inject_event_at_bottom(Event::IncomingMqttMessage {
        topic: "devices/d/messages/devicebound/%24.to=%2Fdevices%2Fd%2Fmessages%2Fdevicebound".to_string(),
        payload: b"hello".to_vec(),
    });

    wait_for(|| received.lock().unwrap().is_some());
    let (payload, _properties) = received.lock().unwrap().take().expect("callback should have fired");
    assert_eq!(payload, b"hello");
}

#[test]
fn method_request_reaches_the_callback_and_response_publishes() {
    let callback_executor = Arc::new(Executor::spawn("methods-callback"));
    let root = RootStage::new(callback_executor);
    let seen_request = Arc::new(Mutex::new(None));
    let seen2 = seen_request.clone();
    root.on_method_request(move |request_id, method_name, payload| {
        *seen2.lock().unwrap() = Some((request_id, method_name, payload));
    });
    let converter = IoTHubMQTTConverter::new();
    let transport = FakeTransport::new();
    let pipeline = Pipeline::new(vec![root, converter, transport.clone()]);

    let (tx, rx) = std::sync::mpsc::channel();
    let op = Operation::new(
        OperationKind::SetIoTHubConnectionArgs(IoTHubConnectionArgs {
            device_id: "d".to_string(),
            module_id: None,
            hostname: "h.example".to_string(),
            gateway_hostname: None,
            ca_cert: None,
            sas_token: None,
            client_cert: None,
        }),
        Box::new(move |r| tx.send(r.is_ok()).unwrap()),
    );
    pipeline.submit(op);
    assert!(rx.recv().unwrap());

    pipeline.inject_event_at_bottom(Event::IncomingMqttMessage {
        topic: "$iothub/methods/POST/reboot/?$rid=42".to_string(),
        payload: b"{}".to_vec(),
    });

    wait_for(|| seen_request.lock().unwrap().is_some());
    let (request_id, method_name, _payload) = seen_request.lock().unwrap().take().unwrap();
    assert_eq!(request_id, "42");
    assert_eq!(method_name, "reboot");

    let (tx2, rx2) = std::sync::mpsc::channel();
    let respond = Operation::new(
        OperationKind::SendMethodResponse {
            request_id,
            status: 200,
            payload: b"{\"ok\":true}".to_vec(),
        },
        Box::new(move |r| tx2.send(r.is_ok()).unwrap()),
    );
    pipeline.submit(respond);
    assert!(rx2.recv().unwrap());

    let published = transport.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "$iothub/methods/res/200/?$rid=42");
}

#[test]
fn get_twin_resolves_from_a_correlated_response() {
    let (pipeline, transport, _executor) = connected_iothub_pipeline();

    let (tx, rx) = std::sync::mpsc::channel();
    let op = Operation::new(
        OperationKind::GetTwin,
        Box::new(move |r| tx.send(r).unwrap()),
    );
    pipeline.submit(op);

    let (topic, _payload) = transport
        .published
        .lock()
        .unwrap()
        .last()
        .cloned()
        .expect("GetTwin should publish a request");
    let request_id = topic
        .strip_prefix("$iothub/twin/GET/?$rid=")
        .expect("unexpected GetTwin topic shape")
        .to_string();

    let document = json!({ "reported": {}, "desired": { "$version": 1 } });
    pipeline.inject_event_at_bottom(Event::IncomingMqttMessage {
        topic: format!("$iothub/twin/res/200/?$rid={request_id}"),
        payload: serde_json::to_vec(&document).unwrap(),
    });

    let result = rx.recv_timeout(Duration::from_secs(5)).expect("GetTwin should resolve");
    match result.expect("GetTwin should succeed") {
        OperationResponse::TwinDocument(doc) => assert_eq!(doc, document),
        other => panic!("expected a twin document, got {other:?}"),
    }
}

#[test]
fn desired_properties_update_reaches_the_callback() {
    let callback_executor = Arc::new(Executor::spawn("desired-props-callback"));
    let root = RootStage::new(callback_executor);
    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    root.on_desired_properties_updated(move |version, patch| {
        *seen2.lock().unwrap() = Some((version, patch));
    });
    let converter = IoTHubMQTTConverter::new();
    let transport = FakeTransport::new();
    let pipeline = Pipeline::new(vec![root, converter, transport]);

    let (tx, rx) = std::sync::mpsc::channel();
    let op = Operation::new(
        OperationKind::SetIoTHubConnectionArgs(IoTHubConnectionArgs {
            device_id: "d".to_string(),
            module_id: None,
            hostname: "h.example".to_string(),
            gateway_hostname: None,
            ca_cert: None,
            sas_token: None,
            client_cert: None,
        }),
        Box::new(move |r| tx.send(r.is_ok()).unwrap()),
    );
    pipeline.submit(op);
    assert!(rx.recv().unwrap());

    let patch = json!({ "$version": 7, "fanSpeed": 100 });
    pipeline.inject_event_at_bottom(Event::IncomingMqttMessage {
        topic: "$iothub/twin/PATCH/properties/desired/?$version=7".to_string(),
        payload: serde_json::to_vec(&patch).unwrap(),
    });

    wait_for(|| seen.lock().unwrap().is_some());
    let (version, received_patch) = seen.lock().unwrap().take().unwrap();
    assert_eq!(version, 7);
    assert_eq!(received_patch, patch);
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if std::time::Instant::now() > deadline {
            panic!("condition did not become true in time");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
