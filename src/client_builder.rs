use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;

use crate::connection::validate_identity;
use crate::options::ClientOptions;
use crate::token::{
    ConnectionString, DeviceKeyTokenSource, SasTokenSource, TokenError, TokenProvider,
    TokenSource,
};
use crate::transport::TransportProtocol;
use crate::IoTHubClient;

impl IoTHubClient {
    /// Get a builder for the IoT hub client
    pub fn builder() -> IoTHubClientBuilder<IoTHubClientBuilderUninitializedHubDetails> {
        IoTHubClientBuilder::default()
    }
}

/// Error related to building the client
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IoTHubClientBuilderError {
    /// Uninitialized field
    #[error("{0} must be initialized")]
    UninitializedField(&'static str),
    /// Custom validation error
    #[error("{0} failed to validate")]
    ValidationError(&'static str),
    /// Error initializing the hub client
    #[error("An error occurred intializing the IoT Hub Client {0}")]
    ClientError(String),
}

/// The client builder has no initialized fields and requires the hub name and device id
#[derive(Debug)]
pub struct IoTHubClientBuilderUninitializedHubDetails;
/// The client builder has hub and device details and can have the token source initialized
#[derive(Debug)]
pub struct IoTHubClientBuilderInitializedHubDetails;
/// The client builder has all fields required to be built
#[derive(Debug)]
pub struct IoTHubClientBuilderInitializedTokenSource;

/// Builder object for the IoT Hub Client
#[derive(Debug)]
pub struct IoTHubClientBuilder<T> {
    iothub_hostname: Option<String>,
    device_id: Option<String>,
    token_source: Option<TokenProvider>,
    options: ClientOptions,
    protocol: TransportProtocol,
    _phantom: PhantomData<T>,
}

impl Default for IoTHubClientBuilder<IoTHubClientBuilderUninitializedHubDetails> {
    fn default() -> IoTHubClientBuilder<IoTHubClientBuilderUninitializedHubDetails> {
        Self {
            iothub_hostname: None,
            device_id: None,
            token_source: None,
            options: ClientOptions::default(),
            protocol: TransportProtocol::Mqtt,
            _phantom: Default::default(),
        }
    }
}

impl<T> IoTHubClientBuilder<T> {
    fn with_token<S>(self, token_source: TokenProvider) -> IoTHubClientBuilder<S> {
        IoTHubClientBuilder {
            iothub_hostname: self.iothub_hostname,
            device_id: self.device_id,
            token_source: Some(token_source),
            options: self.options,
            protocol: self.protocol,
            _phantom: Default::default(),
        }
    }
}

impl IoTHubClientBuilder<IoTHubClientBuilderInitializedTokenSource> {
    /// Timeouts, retry and proxy settings
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Protocol used to reach the hub. Defaults to MQTT.
    pub fn protocol(mut self, protocol: TransportProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Build the IoT hub client. The client starts closed; call `open()` to connect.
    pub async fn build(self) -> Result<IoTHubClient, IoTHubClientBuilderError> {
        let Some(iothub_hostname) = self.iothub_hostname else {
            return Err(IoTHubClientBuilderError::UninitializedField(
                "iothub_hostname",
            ));
        };

        let Some(device_id) = self.device_id else {
            return Err(IoTHubClientBuilderError::UninitializedField("device_id"));
        };

        let Some(token_source) = self.token_source else {
            return Err(IoTHubClientBuilderError::ValidationError(
                "One of `access_key`, `sas_token` or `token_source` must be provided such that the token source can be configured",
            ));
        };

        validate_identity(&iothub_hostname, &device_id)
            .map_err(|e| IoTHubClientBuilderError::ClientError(format!("{e}")))?;

        let renewable = token_source.renewable();
        let options = self.options;
        let client = match self.protocol {
            #[cfg(feature = "mqtt-transport")]
            TransportProtocol::Mqtt => {
                let transport = crate::transport::mqtt::MqttTransport::new(
                    iothub_hostname.clone(),
                    device_id.clone(),
                    token_source,
                    options.clone(),
                );
                IoTHubClient::spawn(transport, iothub_hostname, device_id, options, renewable)
            }
            #[cfg(feature = "https-transport")]
            TransportProtocol::Https => {
                let transport = crate::transport::https::HttpsTransport::new(
                    iothub_hostname.clone(),
                    device_id.clone(),
                    token_source,
                    options.clone(),
                );
                IoTHubClient::spawn(transport, iothub_hostname, device_id, options, renewable)
            }
            #[cfg(feature = "amqp-transport")]
            TransportProtocol::Amqp => {
                let transport = crate::transport::amqp::AmqpTransport::device(
                    iothub_hostname.clone(),
                    device_id.clone(),
                    token_source,
                    options.clone(),
                );
                IoTHubClient::spawn(transport, iothub_hostname, device_id, options, renewable)
            }
            #[allow(unreachable_patterns)]
            protocol => Err(crate::Error::configuration(format!(
                "the transport feature for {:?} is not enabled",
                protocol
            ))),
        }
        .map_err(|e| IoTHubClientBuilderError::ClientError(format!("{e}")))?;

        Ok(client)
    }
}

impl IoTHubClientBuilder<IoTHubClientBuilderUninitializedHubDetails> {
    /// Set the values for the IoT hub hostname and device id
    pub fn iothub_details<T>(
        self,
        iothub_hostname: T,
        device_id: T,
    ) -> IoTHubClientBuilder<IoTHubClientBuilderInitializedHubDetails>
    where
        T: ToString,
    {
        IoTHubClientBuilder {
            iothub_hostname: Some(iothub_hostname.to_string()),
            device_id: Some(device_id.to_string()),
            token_source: None,
            options: self.options,
            protocol: self.protocol,
            _phantom: Default::default(),
        }
    }

    /// Set the values for the IoT hub hostname and device id and credential from the connection
    /// string
    pub fn connection_string<T>(
        self,
        connection_string: T,
    ) -> Result<IoTHubClientBuilder<IoTHubClientBuilderInitializedTokenSource>, TokenError>
    where
        T: AsRef<str>,
    {
        let parsed = ConnectionString::parse(connection_string.as_ref())?;
        let (device_id, token_source) = parsed.device_credentials()?;

        Ok(IoTHubClientBuilder {
            iothub_hostname: Some(parsed.host_name),
            device_id: Some(device_id),
            token_source: Some(token_source),
            options: self.options,
            protocol: self.protocol,
            _phantom: Default::default(),
        })
    }
}

impl IoTHubClientBuilder<IoTHubClientBuilderInitializedHubDetails> {
    /// The the device access key
    pub fn access_key<T>(
        self,
        access_key: T,
    ) -> Result<IoTHubClientBuilder<IoTHubClientBuilderInitializedTokenSource>, TokenError>
    where
        T: AsRef<[u8]>,
    {
        let token_source = DeviceKeyTokenSource::new(
            self.iothub_hostname.as_deref().unwrap_or_default(),
            self.device_id.as_deref().unwrap_or_default(),
            access_key,
        )?;

        Ok(self.with_token(token_source.into()))
    }

    /// A pre-generated shared access signature. The connection cannot renew it.
    pub fn sas_token<T>(
        self,
        sas: T,
    ) -> Result<IoTHubClientBuilder<IoTHubClientBuilderInitializedTokenSource>, TokenError>
    where
        T: Into<String>,
    {
        let token_source = SasTokenSource::new(sas)?;
        Ok(self.with_token(token_source.into()))
    }

    /// A caller supplied credential
    pub fn token_source<S>(
        self,
        token_source: S,
    ) -> IoTHubClientBuilder<IoTHubClientBuilderInitializedTokenSource>
    where
        S: TokenSource + Send + Sync + 'static,
    {
        self.with_token(TokenProvider::Custom(Arc::new(token_source)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_initializes_credentials() {
        let builder = IoTHubClient::builder()
            .connection_string(
                "HostName=hub.azure-devices.net;DeviceId=dev1;SharedAccessKey=c2VjcmV0",
            )
            .unwrap();
        assert_eq!(builder.iothub_hostname.as_deref(), Some("hub.azure-devices.net"));
        assert_eq!(builder.device_id.as_deref(), Some("dev1"));
        assert!(matches!(
            builder.token_source,
            Some(TokenProvider::DeviceKey(_))
        ));
    }

    #[test]
    fn invalid_access_key_is_rejected() {
        let result = IoTHubClient::builder()
            .iothub_details("hub.azure-devices.net", "dev1")
            .access_key("not base64!");
        assert!(matches!(result, Err(TokenError::InvalidKey)));
    }

    #[tokio::test]
    async fn build_rejects_hostname_with_scheme() {
        let result = IoTHubClient::builder()
            .iothub_details("https://hub.azure-devices.net", "dev1")
            .sas_token("SharedAccessSignature sr=hub&sig=abc&se=1")
            .unwrap()
            .build()
            .await;
        assert!(matches!(
            result,
            Err(IoTHubClientBuilderError::ClientError(_))
        ));
    }

    #[cfg(feature = "mqtt-transport")]
    #[tokio::test]
    async fn build_starts_closed() {
        let client = IoTHubClient::builder()
            .iothub_details("hub.azure-devices.net", "dev1")
            .access_key("c2VjcmV0")
            .unwrap()
            .protocol(TransportProtocol::Mqtt)
            .build()
            .await
            .unwrap();
        assert_eq!(client.state(), crate::ConnectionState::Closed);
    }
}
