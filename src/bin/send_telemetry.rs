//! Connects a symmetric-key device and sends a handful of telemetry
//! messages. Reads the connection string from `DEVICE_CONNECTION_STRING`.

use std::env;
use std::time::Duration;

use iothub_device_client::{DeviceClient, Message};
use log::info;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let connection_string = env::var("DEVICE_CONNECTION_STRING")
        .expect("set DEVICE_CONNECTION_STRING to a device or module connection string");

    let client = DeviceClient::from_connection_string(&connection_string)
        .expect("unable to build a device client from the connection string");

    client.connect().expect("unable to connect");
    info!("connected");

    for i in 0..10u32 {
        let message = Message {
            body: format!("{{\"reading\":{i}}}").into_bytes(),
            message_id: Some(i.to_string()),
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        client.send_telemetry(message).expect("unable to send telemetry");
        info!("sent message {i}");
        std::thread::sleep(Duration::from_secs(1));
    }

    client.disconnect().expect("unable to disconnect");
}
