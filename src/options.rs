use std::time::Duration;

use serde::Deserialize;

use crate::dtmi::Dtmi;
use crate::retry::MAX_JITTER;

/// Longest SAS token lifetime accepted, one year
pub const MAX_TOKEN_TTL_SECS: u64 = 86400 * 365;

/// Settings for the exponential backoff used on reconnect and re-send
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryOptions {
    /// Backoff for the first retry
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff
    pub max_delay_ms: u64,
    /// Upper bound for the sum of all backoffs before giving up
    pub max_retry_duration_ms: u64,
    /// Relative jitter applied to each backoff, at most one third
    pub jitter: f64,
    /// Seed for the jitter generator
    pub seed: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            max_retry_duration_ms: 240_000,
            jitter: 0.2,
            seed: 0,
        }
    }
}

/// HTTP proxy to tunnel MQTT and HTTPS connections through
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    /// Proxy host name or address
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Basic authentication user
    #[serde(default)]
    pub username: Option<String>,
    /// Basic authentication password
    #[serde(default)]
    pub password: Option<String>,
}

/// Tunable behaviour of a client connection
///
/// Every field has a default so partial configuration files deserialize.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientOptions {
    /// Time budget for a submitted operation before it resolves with a timeout
    pub operation_timeout_ms: u64,
    /// Time a sent message may stay unacknowledged before it is re-sent
    pub ack_timeout_ms: u64,
    /// Bound on a single transport connect or send
    pub connect_timeout_ms: u64,
    /// MQTT keep alive interval
    pub keep_alive_secs: u16,
    /// Lifetime of generated SAS tokens
    pub token_ttl_secs: u64,
    /// Interval between cloud to device polls on HTTPS
    pub https_poll_interval_ms: u64,
    /// Capacity of the client event channel
    pub event_channel_capacity: usize,
    /// Digital twin model id announced when connecting
    pub model_id: Option<String>,
    /// Proxy for tunneled transports
    pub proxy: Option<ProxySettings>,
    /// Backoff settings
    pub retry: RetryOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 240_000,
            ack_timeout_ms: 60_000,
            connect_timeout_ms: 30_000,
            keep_alive_secs: 60,
            token_ttl_secs: 3_600,
            https_poll_interval_ms: 10_000,
            event_channel_capacity: 64,
            model_id: None,
            proxy: None,
            retry: RetryOptions::default(),
        }
    }
}

impl ClientOptions {
    /// Check the options for values the client cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        let positive = [
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("token_ttl_secs", self.token_ttl_secs),
            ("https_poll_interval_ms", self.https_poll_interval_ms),
            ("retry.base_delay_ms", self.retry.base_delay_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(crate::Error::configuration(format!(
                "{} must be greater than zero",
                name
            )));
        }
        if self.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(crate::Error::configuration(format!(
                "token_ttl_secs must be at most {}",
                MAX_TOKEN_TTL_SECS
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::configuration(
                "event_channel_capacity must be greater than zero",
            ));
        }
        if !(0.0..=MAX_JITTER).contains(&self.retry.jitter) {
            return Err(crate::Error::configuration(format!(
                "retry.jitter must be between 0 and {:.3}",
                MAX_JITTER
            )));
        }
        if let Some(model_id) = &self.model_id {
            model_id.parse::<Dtmi>()?;
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.trim().is_empty() {
                return Err(crate::Error::configuration("proxy host cannot be empty"));
            }
        }
        Ok(())
    }

    pub(crate) fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub(crate) fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let options: ClientOptions =
            serde_json::from_str(r#"{"ack_timeout_ms": 500, "retry": {"jitter": 0.1}}"#).unwrap();
        assert_eq!(options.ack_timeout_ms, 500);
        assert_eq!(options.retry.jitter, 0.1);
        assert_eq!(options.retry.base_delay_ms, 100);
        assert_eq!(options.operation_timeout_ms, 240_000);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn rejects_excessive_jitter() {
        let mut options = ClientOptions::default();
        options.retry.jitter = 0.5;
        assert!(matches!(
            options.validate(),
            Err(crate::Error::Configuration(_))
        ));
    }

    #[test]
    fn token_lifetime_is_bounded() {
        let options = ClientOptions {
            token_ttl_secs: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(crate::Error::Configuration(_))
        ));

        // Timeouts are clamped where they are applied
        let options = ClientOptions {
            operation_timeout_ms: u64::MAX,
            ack_timeout_ms: u64::MAX,
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_model_id() {
        let options = ClientOptions {
            model_id: Some("not-a-dtmi".into()),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = ClientOptions {
            model_id: Some("dtmi:com:example:TemperatureController;2".into()),
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }
}
