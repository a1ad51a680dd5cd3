//! Configuration for channels, negotiators and sessions.
//!
//! Every timing constant of the protocol is a default here rather than a
//! fixed value. Configuration can be built in code, loaded from a JSON file,
//! or overridden from `NATLINK_*` environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_MESSAGE_LEN;
use crate::error::ConfigError;
use crate::types::{FRAME_HEADER_LEN, MAX_PAYLOAD};

/// Largest UDP payload over IPv4.
const MAX_UDP_DATAGRAM: usize = 65_507;

/// Durations travel as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Framed datagram channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Local interface to bind.
    pub bind_addr: IpAddr,
    /// Port to bind; `None` picks an ephemeral port.
    pub preferred_port: Option<u16>,
    /// Largest payload accepted by `send` and by the receive loop.
    pub max_payload: usize,
    /// Receive wait before the loop re-checks its run flag.
    #[serde(with = "millis")]
    pub recv_timeout: Duration,
    /// Listener deliveries allowed in flight at once.
    pub dispatch_limit: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            preferred_port: None,
            max_payload: MAX_PAYLOAD,
            recv_timeout: Duration::from_millis(1000),
            dispatch_limit: 256,
        }
    }
}

impl ChannelConfig {
    /// Default settings bound to a specific port.
    pub fn with_port(port: u16) -> Self {
        Self {
            preferred_port: Some(port),
            ..Self::default()
        }
    }

    /// Default settings bound to loopback on an ephemeral port.
    pub fn loopback() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }
}

/// Send cadence and retry cap of one negotiation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTiming {
    /// Delay between sends.
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Sends allowed before the phase gives up.
    pub max_attempts: u32,
}

impl PhaseTiming {
    /// Create a phase timing.
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Peer negotiator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// Contact request phase (~60s with defaults).
    pub request: PhaseTiming,
    /// Request-response phase (~1s with defaults).
    pub request_response: PhaseTiming,
    /// Keep-alive phase; the cap counts consecutive unacknowledged probes.
    pub keep_alive: PhaseTiming,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            request: PhaseTiming::new(Duration::from_millis(500), 120),
            request_response: PhaseTiming::new(Duration::from_millis(200), 5),
            keep_alive: PhaseTiming::new(Duration::from_millis(1000), 5),
        }
    }
}

/// Message session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on establishing the stream connection.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Read wait before the receiver re-checks its run flag.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    /// Sender wait when the queue is empty.
    #[serde(with = "millis")]
    pub idle_interval: Duration,
    /// Bound on flushing the send queue during `disconnect`. Whatever is
    /// still queued when it expires is dropped.
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    /// How long `disconnect` waits for the peer to close after the notice.
    #[serde(with = "millis")]
    pub disconnect_linger: Duration,
    /// Reconnect tries after a failure, when a listener opts in.
    pub reconnect_attempts: u32,
    /// Delay before each reconnect try.
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    /// Largest encoded message accepted in either direction.
    pub max_message_len: usize,
    /// Listener deliveries allowed in flight at once.
    pub dispatch_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(1000),
            idle_interval: Duration::from_millis(10),
            write_timeout: Duration::from_secs(5),
            disconnect_linger: Duration::from_secs(2),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(500),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            dispatch_limit: 256,
        }
    }
}

/// Session acceptor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptorConfig {
    /// Local interface to listen on.
    pub bind_addr: IpAddr,
    /// Settings applied to every accepted session.
    pub session: SessionConfig,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            session: SessionConfig::default(),
        }
    }
}

/// All transport settings in one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Datagram channel.
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Peer negotiator.
    #[serde(default)]
    pub negotiator: NegotiatorConfig,
    /// Outbound sessions.
    #[serde(default)]
    pub session: SessionConfig,
    /// Session acceptor.
    #[serde(default)]
    pub acceptor: AcceptorConfig,
}

impl TransportConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Defaults with `NATLINK_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = env_parse("NATLINK_UDP_PORT")? {
            config.channel.preferred_port = Some(port);
        }
        if let Some(max) = env_parse("NATLINK_MAX_PAYLOAD")? {
            config.channel.max_payload = max;
        }
        if let Some(ms) = env_parse("NATLINK_REQUEST_INTERVAL_MS")? {
            config.negotiator.request.interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("NATLINK_REQUEST_ATTEMPTS")? {
            config.negotiator.request.max_attempts = n;
        }
        if let Some(ms) = env_parse("NATLINK_KEEP_ALIVE_INTERVAL_MS")? {
            config.negotiator.keep_alive.interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("NATLINK_KEEP_ALIVE_ATTEMPTS")? {
            config.negotiator.keep_alive.max_attempts = n;
        }
        if let Some(ms) = env_parse("NATLINK_READ_TIMEOUT_MS")? {
            config.session.read_timeout = Duration::from_millis(ms);
            config.acceptor.session.read_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("NATLINK_RECONNECT_ATTEMPTS")? {
            config.session.reconnect_attempts = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the workers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let channel = &self.channel;
        if channel.max_payload + FRAME_HEADER_LEN > MAX_UDP_DATAGRAM {
            return Err(ConfigError::Invalid(format!(
                "max_payload {} does not fit in a UDP datagram",
                channel.max_payload
            )));
        }
        require_nonzero("channel.recv_timeout", channel.recv_timeout)?;
        if channel.dispatch_limit == 0 {
            return Err(ConfigError::Invalid("channel.dispatch_limit must be > 0".into()));
        }

        for (name, phase) in [
            ("negotiator.request", self.negotiator.request),
            ("negotiator.request_response", self.negotiator.request_response),
            ("negotiator.keep_alive", self.negotiator.keep_alive),
        ] {
            require_nonzero(name, phase.interval)?;
            if phase.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!("{name}.max_attempts must be > 0")));
            }
        }

        for (name, session) in [("session", &self.session), ("acceptor.session", &self.acceptor.session)] {
            require_nonzero(&format!("{name}.read_timeout"), session.read_timeout)?;
            require_nonzero(&format!("{name}.idle_interval"), session.idle_interval)?;
            require_nonzero(&format!("{name}.connect_timeout"), session.connect_timeout)?;
            require_nonzero(&format!("{name}.write_timeout"), session.write_timeout)?;
            if session.dispatch_limit == 0 || session.max_message_len == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.dispatch_limit and {name}.max_message_len must be > 0"
                )));
            }
        }

        Ok(())
    }
}

fn require_nonzero(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::Invalid(format!("{name} must be non-zero")))
    } else {
        Ok(())
    }
}

/// Read and parse `name`. Unset is `None`; set but unparsable is an error.
fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid(format!("{name} has invalid value {raw:?}")))
}
