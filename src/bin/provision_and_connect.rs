//! Registers a device with the Device Provisioning Service, then connects to
//! the IoT Hub it was assigned to and sends one telemetry message. Reads
//! `DPS_ID_SCOPE`, `DPS_REGISTRATION_ID`, `DPS_SYMMETRIC_KEY`, and
//! `DPS_DEVICE_KEY` (the device's own per-device derived key, used to build
//! the IoT Hub connection string after assignment) from the environment.

use std::env;

use iothub_device_client::{DeviceClient, Message, ProvisioningClient};
use log::info;

const PROVISIONING_HOST: &str = "global.azure-devices-provisioning.net";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let id_scope = env::var("DPS_ID_SCOPE").expect("set DPS_ID_SCOPE");
    let registration_id = env::var("DPS_REGISTRATION_ID").expect("set DPS_REGISTRATION_ID");
    let symmetric_key = env::var("DPS_SYMMETRIC_KEY").expect("set DPS_SYMMETRIC_KEY");
    let device_key = env::var("DPS_DEVICE_KEY").expect("set DPS_DEVICE_KEY");

    let provisioning = ProvisioningClient::new(
        &id_scope,
        &registration_id,
        PROVISIONING_HOST,
        Some(symmetric_key),
    )
    .expect("unable to build the provisioning client");

    let result = provisioning.register().expect("registration failed");
    info!(
        "assigned to hub `{}` as device `{}`",
        result.assigned_hub, result.device_id
    );

    let connection_string = format!(
        "HostName={};DeviceId={};SharedAccessKey={}",
        result.assigned_hub, result.device_id, device_key
    );
    let client = DeviceClient::from_connection_string(&connection_string)
        .expect("unable to build a device client for the assigned hub");

    client.connect().expect("unable to connect to the assigned hub");
    client
        .send_telemetry(Message {
            body: b"provisioned and connected".to_vec(),
            ..Default::default()
        })
        .expect("unable to send telemetry");
    client.disconnect().expect("unable to disconnect");
}
