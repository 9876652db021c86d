//! Engine and per-server configuration.
//!
//! [`ClientConfig`] covers engine-wide policy (decoding, pacing, reconnect,
//! keepalive) and applies to every connection the [`crate::Client`] opens.
//! [`ServerSpec`] describes one server endpoint and the identity to register
//! with. Both derive serde so they can be loaded from a TOML or JSON file;
//! every field has a default, so partial configs deserialize cleanly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use slirc_wire::{DecodePolicy, MAX_LINE_LEN};

use crate::ratelimit::RateLimit;
use crate::reconnect::ReconnectPolicy;
use crate::schedule::SchedulerConfig;

/// Periodic PING policy for idle connections.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// How often to check traffic and send a PING when idle.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Close the connection when nothing has arrived for this long.
    #[serde(with = "duration_secs")]
    pub stale_after: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(240),
        }
    }
}

/// Engine-wide configuration shared by all connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Label of the wire encoding, resolved by the decoder ("utf-8",
    /// "latin-1", "shift_jis", ...).
    pub encoding: String,
    /// What to do with bytes the encoding cannot decode.
    pub decode_policy: DecodePolicy,
    /// Outbound pacing; `None` disables the token bucket entirely.
    pub rate_limit: Option<RateLimit>,
    /// Automatic reconnect backoff; `None` means disconnects are final.
    pub reconnect: Option<ReconnectPolicy>,
    /// How long after 001 to wait for the feature burst before announcing
    /// registration anyway.
    #[serde(with = "duration_secs")]
    pub registration_timeout: Duration,
    /// Idle PING policy; `None` disables keepalives.
    pub keepalive: Option<KeepaliveConfig>,
    /// Scheduler tuning.
    pub scheduler: SchedulerConfig,
    /// Hard limit on one outbound line, terminator included.
    pub max_line_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            encoding: "utf-8".to_owned(),
            decode_policy: DecodePolicy::default(),
            rate_limit: None,
            reconnect: Some(ReconnectPolicy::default()),
            registration_timeout: Duration::from_secs(30),
            keepalive: Some(KeepaliveConfig::default()),
            scheduler: SchedulerConfig::default(),
            max_line_len: MAX_LINE_LEN,
        }
    }
}

/// One server endpoint plus the identity to register with.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    /// Negotiate TLS before the IRC handshake.
    pub tls: bool,
    pub nickname: String,
    pub username: String,
    pub realname: String,
    /// Sent as PASS before NICK/USER when present.
    pub password: Option<String>,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 6667,
            tls: false,
            nickname: String::new(),
            username: String::new(),
            realname: String::new(),
            password: None,
        }
    }
}

impl ServerSpec {
    /// Plain-text spec; username and realname default to the nickname.
    pub fn new(host: impl Into<String>, port: u16, nickname: impl Into<String>) -> Self {
        let nickname = nickname.into();
        Self {
            host: host.into(),
            port,
            username: nickname.clone(),
            realname: nickname.clone(),
            nickname,
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_user(mut self, username: impl Into<String>, realname: impl Into<String>) -> Self {
        self.username = username.into();
        self.realname = realname.into();
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"encoding": "latin-1", "registration_timeout": 10}"#)
                .unwrap();
        assert_eq!(config.encoding, "latin-1");
        assert_eq!(config.registration_timeout, Duration::from_secs(10));
        assert_eq!(config.max_line_len, MAX_LINE_LEN);
        assert!(config.reconnect.is_some());
    }

    #[test]
    fn server_spec_defaults_identity_from_nickname() {
        let spec = ServerSpec::new("irc.example.net", 6697, "ana").with_tls(true);
        assert_eq!(spec.username, "ana");
        assert_eq!(spec.realname, "ana");
        assert!(spec.tls);
        assert!(spec.password.is_none());
    }
}
