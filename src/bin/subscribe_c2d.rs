//! Connects a device, enables cloud-to-device messages and direct methods,
//! and echoes each method call back as a `200` with the same payload.
//! Reads the connection string from `DEVICE_CONNECTION_STRING`.

use std::env;

use iothub_device_client::DeviceClient;
use log::info;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let connection_string = env::var("DEVICE_CONNECTION_STRING")
        .expect("set DEVICE_CONNECTION_STRING to a device or module connection string");

    let client = DeviceClient::from_connection_string(&connection_string)
        .expect("unable to build a device client from the connection string");

    client.on_c2d_message(|payload, properties| {
        info!(
            "received a C2D message ({} bytes, {} properties)",
            payload.len(),
            properties.len()
        );
    });

    let client = std::sync::Arc::new(client);
    let responder = client.clone();
    client.on_method_request(move |request_id, method_name, payload| {
        info!("direct method `{method_name}` invoked (request {request_id})");
        if let Err(e) = responder.send_method_response(request_id, 200, payload) {
            log::error!("failed to answer direct method: {e}");
        }
    });

    client.connect().expect("unable to connect");
    client.enable_feature("c2d").expect("unable to enable c2d");
    client.enable_feature("methods").expect("unable to enable methods");

    info!("listening for C2D messages and direct methods; press Ctrl+C to exit");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}
