use std::time::Duration;

use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::error::TransportError;
use crate::options::DEFAULT_TIMEOUT;

/// Connection and retry settings of an [`AmqpTransport`](super::AmqpTransport).
#[derive(TypedBuilder, Deserialize, Debug, Clone)]
pub struct AmqpSettings {
    /// The url scheme, `amqp` or `amqps`.
    #[builder(default = String::from("amqp"), setter(into))]
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[builder(setter(into))]
    pub host: String,
    #[builder(default = 5672)]
    #[serde(default = "default_port")]
    pub port: u16,
    /// Virtual host. Empty means the default `/` one.
    #[builder(default = String::from("/"), setter(into))]
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[builder(setter(into))]
    pub username: String,
    #[builder(setter(into))]
    pub password: String,
    /// Pause between two connection attempts.
    #[builder(default = Duration::from_secs(1))]
    #[serde(default = "default_reconnect_delay", with = "millis")]
    pub reconnect_delay: Duration,
    /// Upper bound on connection attempts; unbounded when `None`, in which case only
    /// `connection_timeout` stops the retry loop.
    #[builder(default)]
    #[serde(default)]
    pub reconnect_max_attempts: Option<u32>,
    /// Total time the retry loop may spend before the connection is reported as failed.
    #[builder(default = Duration::from_secs(120))]
    #[serde(default = "default_connection_timeout", with = "millis")]
    pub connection_timeout: Duration,
    /// Time a waiting command spends in the `<name>_delay` queue before being redelivered.
    #[builder(default = Duration::from_millis(500))]
    #[serde(default = "default_delay_ttl", with = "millis")]
    pub delay_ttl: Duration,
    /// Deadline of `send_listen` calls made without an explicit timeout.
    #[builder(default = DEFAULT_TIMEOUT)]
    #[serde(default = "default_timeout", with = "millis")]
    pub default_timeout: Duration,
    /// When true a dropped connection is reported as failed right away, without reconnecting.
    #[builder(default)]
    #[serde(default)]
    pub fail_on_disconnect: bool,
}

impl AmqpSettings {
    /// Broker address as a structured uri: credentials are passed as they are, so they may hold
    /// any character a url would reserve.
    pub fn uri(&self) -> Result<AMQPUri, TransportError> {
        let scheme: AMQPScheme = self.protocol.parse().map_err(TransportError::Settings)?;
        let vhost: String = match self.vhost.as_str() {
            "" | "/" => String::from("/"),
            vhost => vhost.trim_start_matches('/').to_string(),
        };
        Ok(AMQPUri {
            scheme,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost,
            ..AMQPUri::default()
        })
    }
}

fn default_protocol() -> String {
    String::from("amqp")
}

const fn default_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    String::from("/")
}

const fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_connection_timeout() -> Duration {
    Duration::from_secs(120)
}

const fn default_delay_ttl() -> Duration {
    Duration::from_millis(500)
}

const fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Durations are read as a number of milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
