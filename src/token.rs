use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac, NewMac};
use sha2::Sha256;
use thiserror::Error;

const DEVICEID_KEY: &str = "DeviceId";
const HOSTNAME_KEY: &str = "HostName";
const SHAREDACCESSKEY_KEY: &str = "SharedAccessKey";
const SHAREDACCESSKEYNAME_KEY: &str = "SharedAccessKeyName";
const SHAREDACCESSSIGNATURE_KEY: &str = "SharedAccessSignature";

const SAS_PREFIX: &str = "SharedAccessSignature ";

const RESOURCE_URI_SET: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

/// Credential problems detected while parsing or generating tokens
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenError {
    /// A required connection string component is absent
    #[error("connection string is missing {0}")]
    MissingField(&'static str),
    /// A connection string segment is not `key=value`
    #[error("malformed connection string segment '{0}'")]
    MalformedSegment(String),
    /// The shared access key is not valid base64
    #[error("shared access key is not valid base64")]
    InvalidKey,
    /// A fixed SAS token does not look like a shared access signature
    #[error("malformed shared access signature")]
    MalformedSignature,
    /// A caller supplied token source failed
    #[error("token source failed: {0}")]
    Source(String),
}

/// Produces the password presented to the hub
pub trait TokenSource {
    /// Token valid until `expiry`
    fn get(&self, expiry: &DateTime<Utc>) -> Result<String, TokenError>;

    /// Whether asking again yields a fresh token, so connections can renew before expiry
    fn renewable(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for dyn TokenSource + Send + Sync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSource")
    }
}

/// A pre-generated shared access signature. It cannot be renewed.
#[derive(Debug, Clone)]
pub struct SasTokenSource {
    sas: String,
}

impl SasTokenSource {
    ///
    pub fn new(sas: impl Into<String>) -> Result<Self, TokenError> {
        let sas = sas.into();
        let valid = sas
            .strip_prefix(SAS_PREFIX)
            .map(|fields| fields.contains("sr=") && fields.contains("sig="))
            .unwrap_or(false);
        if !valid {
            return Err(TokenError::MalformedSignature);
        }
        Ok(Self { sas })
    }
}

impl TokenSource for SasTokenSource {
    fn get(&self, _: &DateTime<Utc>) -> Result<String, TokenError> {
        Ok(self.sas.clone())
    }

    fn renewable(&self) -> bool {
        false
    }
}

/// Signs device tokens with the device's shared access key
#[derive(Debug, Clone)]
pub struct DeviceKeyTokenSource {
    resource_uri: String,
    key: Vec<u8>,
}

impl DeviceKeyTokenSource {
    ///
    pub fn new(
        hub: &str,
        device_id: &str,
        key: impl AsRef<[u8]>,
    ) -> Result<DeviceKeyTokenSource, TokenError> {
        Ok(DeviceKeyTokenSource {
            resource_uri: format!("{}/devices/{}", hub, device_id),
            key: base64::decode(key).map_err(|_| TokenError::InvalidKey)?,
        })
    }
}

impl TokenSource for DeviceKeyTokenSource {
    fn get(&self, expiry: &DateTime<Utc>) -> Result<String, TokenError> {
        let sas = sign(&self.resource_uri, &self.key, expiry.timestamp(), None);
        trace!("Using device key token: {}", sas);
        Ok(sas)
    }
}

/// Signs service tokens with a shared access policy key
#[derive(Debug, Clone)]
pub struct ServiceKeyTokenSource {
    hostname: String,
    policy_name: String,
    key: Vec<u8>,
}

impl ServiceKeyTokenSource {
    ///
    pub fn new(
        hostname: &str,
        policy_name: &str,
        key: impl AsRef<[u8]>,
    ) -> Result<Self, TokenError> {
        Ok(Self {
            hostname: hostname.to_owned(),
            policy_name: policy_name.to_owned(),
            key: base64::decode(key).map_err(|_| TokenError::InvalidKey)?,
        })
    }

    /// The shared access policy the tokens are issued for
    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }
}

impl TokenSource for ServiceKeyTokenSource {
    fn get(&self, expiry: &DateTime<Utc>) -> Result<String, TokenError> {
        Ok(sign(
            &self.hostname,
            &self.key,
            expiry.timestamp(),
            Some(&self.policy_name),
        ))
    }
}

fn sign(resource_uri: &str, key: &[u8], expiry: i64, policy: Option<&str>) -> String {
    let resource_uri =
        percent_encoding::utf8_percent_encode(resource_uri, RESOURCE_URI_SET).to_string();
    let to_sign = format!("{}\n{}", resource_uri, expiry);
    let signature = generate_token(key, &to_sign);

    let mut sas = format!(
        "{}sr={}&{}&se={}",
        SAS_PREFIX, resource_uri, signature, expiry
    );
    if let Some(policy) = policy {
        sas.push_str("&skn=");
        sas.push_str(policy);
    }
    sas
}

/// HMAC-SHA256 of `message`, base64 encoded and rendered as a url encoded `sig=` pair
pub(crate) fn generate_token(key: &[u8], message: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_varkey(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    };
    mac.update(message.as_bytes());
    let signature = base64::encode(mac.finalize().into_bytes());

    form_urlencoded::Serializer::new(String::new())
        .append_pair("sig", &signature)
        .finish()
}

/// Credential in use by a client. Exactly one kind is configured per client.
#[derive(Debug, Clone)]
pub enum TokenProvider {
    /// Device shared access key
    DeviceKey(DeviceKeyTokenSource),
    /// Service shared access policy key
    ServiceKey(ServiceKeyTokenSource),
    /// Fixed shared access signature
    Sas(SasTokenSource),
    /// Caller supplied token credential
    Custom(Arc<dyn TokenSource + Send + Sync>),
}

impl TokenSource for TokenProvider {
    fn get(&self, expiry: &DateTime<Utc>) -> Result<String, TokenError> {
        match self {
            TokenProvider::DeviceKey(source) => source.get(expiry),
            TokenProvider::ServiceKey(source) => source.get(expiry),
            TokenProvider::Sas(source) => source.get(expiry),
            TokenProvider::Custom(source) => source.get(expiry),
        }
    }

    fn renewable(&self) -> bool {
        match self {
            TokenProvider::DeviceKey(source) => source.renewable(),
            TokenProvider::ServiceKey(source) => source.renewable(),
            TokenProvider::Sas(source) => source.renewable(),
            TokenProvider::Custom(source) => source.renewable(),
        }
    }
}

impl From<DeviceKeyTokenSource> for TokenProvider {
    fn from(source: DeviceKeyTokenSource) -> Self {
        TokenProvider::DeviceKey(source)
    }
}

impl From<ServiceKeyTokenSource> for TokenProvider {
    fn from(source: ServiceKeyTokenSource) -> Self {
        TokenProvider::ServiceKey(source)
    }
}

impl From<SasTokenSource> for TokenProvider {
    fn from(source: SasTokenSource) -> Self {
        TokenProvider::Sas(source)
    }
}

/// Components of a device or service connection string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    /// `HostName`
    pub host_name: String,
    /// `DeviceId`, absent for service connection strings
    pub device_id: Option<String>,
    /// `SharedAccessKeyName`, present for service connection strings
    pub shared_access_key_name: Option<String>,
    /// `SharedAccessKey`
    pub shared_access_key: Option<String>,
    /// `SharedAccessSignature`
    pub shared_access_signature: Option<String>,
}

impl ConnectionString {
    /// Parse `HostName=...;DeviceId=...;SharedAccessKey=...` style strings.
    ///
    /// Values may contain `=` (base64 padding); unknown keys are ignored.
    pub fn parse(connection_string: &str) -> Result<Self, TokenError> {
        let mut parsed = ConnectionString::default();
        let mut host_name = None;

        for segment in connection_string.split(';').filter(|s| !s.trim().is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| TokenError::MalformedSegment(segment.to_owned()))?;
            let value = value.trim().to_owned();
            match key.trim() {
                HOSTNAME_KEY => host_name = Some(value),
                DEVICEID_KEY => parsed.device_id = Some(value),
                SHAREDACCESSKEY_KEY => parsed.shared_access_key = Some(value),
                SHAREDACCESSKEYNAME_KEY => parsed.shared_access_key_name = Some(value),
                SHAREDACCESSSIGNATURE_KEY => parsed.shared_access_signature = Some(value),
                _ => (), // Ignore extraneous component in the connection string
            }
        }

        parsed.host_name = host_name
            .filter(|h| !h.is_empty())
            .ok_or(TokenError::MissingField(HOSTNAME_KEY))?;
        if parsed.shared_access_key.is_none() && parsed.shared_access_signature.is_none() {
            return Err(TokenError::MissingField(SHAREDACCESSKEY_KEY));
        }
        Ok(parsed)
    }

    /// Device id and token provider for a device connection string
    pub fn device_credentials(&self) -> Result<(String, TokenProvider), TokenError> {
        let device_id = self
            .device_id
            .clone()
            .filter(|d| !d.is_empty())
            .ok_or(TokenError::MissingField(DEVICEID_KEY))?;
        let provider = match (&self.shared_access_key, &self.shared_access_signature) {
            (Some(key), _) => DeviceKeyTokenSource::new(&self.host_name, &device_id, key)?.into(),
            (None, Some(sas)) => SasTokenSource::new(sas.clone())?.into(),
            (None, None) => return Err(TokenError::MissingField(SHAREDACCESSKEY_KEY)),
        };
        Ok((device_id, provider))
    }

    /// Token provider for a service connection string
    pub fn service_credentials(&self) -> Result<ServiceKeyTokenSource, TokenError> {
        let policy = self
            .shared_access_key_name
            .as_deref()
            .ok_or(TokenError::MissingField(SHAREDACCESSKEYNAME_KEY))?;
        let key = self
            .shared_access_key
            .as_deref()
            .ok_or(TokenError::MissingField(SHAREDACCESSKEY_KEY))?;
        ServiceKeyTokenSource::new(&self.host_name, policy, key)
    }
}
