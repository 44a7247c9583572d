use azure_iot_transport::{ClientOptions, FileUploadNotificationReceiver};
use log::info;

#[tokio::main]
async fn main() -> azure_iot_transport::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenv::dotenv().ok();

    let connection_string = std::env::var("IOTHUB_SERVICE_CONNECTION_STRING").expect(
        "Set the service connection string in the IOTHUB_SERVICE_CONNECTION_STRING environment variable",
    );

    let mut receiver = FileUploadNotificationReceiver::from_connection_string(
        &connection_string,
        ClientOptions::default(),
    )?;
    receiver.open().await?;
    info!("Waiting for file upload notifications");

    loop {
        match receiver.receive().await? {
            Some(notification) => info!(
                "{} uploaded {} ({} bytes)",
                notification.device_id, notification.blob_name, notification.blob_size_in_bytes
            ),
            None => info!("No notification within the last minute"),
        }
    }
}
