#[macro_use]
extern crate log;

use azure_iot_transport::{
    ClientEvent, ClientOptions, IoTHubClient, Message, NotificationKind, TransportProtocol,
};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DeviceConfig {
    connection_string: String,
    #[serde(default)]
    use_https: bool,
    #[serde(default)]
    client: ClientOptions,
}

impl DeviceConfig {
    fn from_env() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        let mut cfg = config::Config::default();
        cfg.merge(config::File::with_name("demos/config").required(false))?;
        cfg.merge(config::Environment::with_prefix("IOT").separator("__"))?;
        cfg.try_into()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let DeviceConfig {
        connection_string,
        use_https,
        client: options,
    } = DeviceConfig::from_env()?;

    let protocol = if use_https {
        TransportProtocol::Https
    } else {
        TransportProtocol::Mqtt
    };

    let client = IoTHubClient::builder()
        .connection_string(connection_string)?
        .options(options)
        .protocol(protocol)
        .build()
        .await?;

    let mut events = client
        .take_event_receiver()
        .expect("first call returns the receiver");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::ConnectionStatus { state, reason } => {
                    info!("Connection is {:?} ({:?})", state, reason)
                }
                ClientEvent::Notification(notification) => match notification.kind {
                    NotificationKind::CloudToDevice => {
                        info!("Received message {:?}", notification.message)
                    }
                    kind => info!("Received {:?}", kind),
                },
            }
        }
    });

    client.open().await?;
    info!("Initialized client");

    let handles: Vec<_> = (0..5)
        .map(|count| {
            let msg = Message::builder()
                .set_body(format!("Message #{}", count).into_bytes())
                .set_message_id(format!("{}-t", count))
                .build();
            client.submit(azure_iot_transport::MessageKind::Telemetry, msg)
        })
        .collect();

    for handle in handles {
        let delivered = handle.await?;
        info!("Message {} delivered", delivered.correlation_id);
    }

    client.close().await?;
    Ok(())
}
