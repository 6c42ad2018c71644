//! Configuration file support.
//!
//! The configuration file is YAML or JSON, selected by file extension
//! (unknown extensions try YAML first, then JSON). Mappings are written in
//! the compact `"proto:local:remote"` string form. Validation happens at
//! load time; a server configuration silently discards any mappings since
//! the mapping set always comes from the client.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Default STUN server used when the config does not name one.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Default secondary STUN server, used for cone-NAT detection.
pub const DEFAULT_SECONDARY_STUN_SERVER: &str = "stun1.l.google.com:19302";

/// Default watcher cadence for mapping-update polling, in seconds.
pub const DEFAULT_WATCH_INTERVAL_SECS: u64 = 2;

/// Default UDP session idle timeout, in seconds.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;

/// Role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

impl Mode {
    /// The role of the peer on the other side of the room.
    pub fn peer_role(self) -> &'static str {
        match self {
            Mode::Client => "server",
            Mode::Server => "client",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Client => "client",
            Mode::Server => "server",
        }
    }
}

/// Forwarded protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A single port forwarding rule.
///
/// `local_port` is the port the client exposes to applications;
/// `remote_port` is the loopback service port on the server host. The
/// canonical textual form is `"proto:local:remote"`, which is also the wire
/// and config representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_port: u16,
}

impl FromStr for PortMapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::config(format!(
                "port mapping '{}' must be in proto:local:remote format",
                s
            )));
        }

        let protocol = match parts[0].to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                return Err(Error::config(format!(
                    "protocol '{}' must be tcp or udp",
                    other
                )))
            }
        };

        let parse_port = |field: &str, value: &str| -> Result<u16> {
            let port: u16 = value.parse().map_err(|e| {
                Error::config_with_source(format!("invalid {} port '{}'", field, value), e)
            })?;
            if port == 0 {
                return Err(Error::config(format!("{} port must be in 1..65535", field)));
            }
            Ok(port)
        };

        Ok(PortMapping {
            protocol,
            local_port: parse_port("local", parts[1])?,
            remote_port: parse_port("remote", parts[2])?,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.protocol, self.local_port, self.remote_port)
    }
}

impl Serialize for PortMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PortMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub mode: Mode,

    /// Shared room identifier scoping this client/server pair.
    pub room_id: String,

    /// Base URL of the HTTP signaling endpoint.
    pub signaling_url: String,

    /// Primary STUN server in host:port form.
    #[serde(default = "default_stun_server")]
    pub stun_server: String,

    /// Secondary STUN server used for cone-NAT detection.
    #[serde(default = "default_secondary_stun_server")]
    pub secondary_stun_server: String,

    /// Port forwarding rules. Required for clients, ignored for servers.
    #[serde(default)]
    pub mappings: Vec<PortMapping>,

    /// Default log filter (overridable with RUST_LOG).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Cadence of the server-side mapping-update watcher, in seconds.
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,

    /// Idle timeout for UDP forwarding sessions, in seconds.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
}

fn default_stun_server() -> String {
    DEFAULT_STUN_SERVER.to_string()
}

fn default_secondary_stun_server() -> String {
    DEFAULT_SECONDARY_STUN_SERVER.to_string()
}

fn default_watch_interval() -> u64 {
    DEFAULT_WATCH_INTERVAL_SECS
}

fn default_session_timeout() -> u64 {
    DEFAULT_SESSION_TIMEOUT_SECS
}

impl Config {
    /// Load configuration from a file, selecting the parser by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::config_with_source(format!("failed to read config file {}", path.display()), e)
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let mut config: Config = match ext.as_deref() {
            Some("yml") | Some("yaml") => serde_yaml::from_str(&data)
                .map_err(|e| Error::config_with_source("failed to parse YAML config", e))?,
            Some("json") => serde_json::from_str(&data)
                .map_err(|e| Error::config_with_source("failed to parse JSON config", e))?,
            _ => serde_yaml::from_str(&data)
                .or_else(|_| serde_json::from_str(&data))
                .map_err(|e| {
                    Error::config_with_source("failed to parse config as YAML or JSON", e)
                })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate field-level invariants and normalize role-specific fields.
    ///
    /// - `signalingUrl` must be a valid http(s) URL
    /// - client mode requires at least one mapping
    /// - `(protocol, localPort)` must be unique across the mapping set
    /// - server mode discards any configured mappings
    pub fn validate(&mut self) -> Result<()> {
        if self.room_id.is_empty() {
            return Err(Error::config("'roomId' is required and cannot be empty"));
        }

        let url = url::Url::parse(&self.signaling_url).map_err(|e| {
            Error::config_with_source(
                format!("'signalingUrl' '{}' is not a valid URL", self.signaling_url),
                e,
            )
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::config(format!(
                "'signalingUrl' scheme '{}' must be http or https",
                url.scheme()
            )));
        }

        match self.mode {
            Mode::Client => {
                if self.mappings.is_empty() {
                    return Err(Error::config(
                        "client mode requires at least one port mapping",
                    ));
                }
                for (i, m) in self.mappings.iter().enumerate() {
                    let duplicate = self.mappings[..i]
                        .iter()
                        .any(|o| o.protocol == m.protocol && o.local_port == m.local_port);
                    if duplicate {
                        return Err(Error::config(format!(
                            "duplicate mapping for {} local port {}",
                            m.protocol, m.local_port
                        )));
                    }
                }
            }
            Mode::Server => {
                // The mapping set always comes from the client registration.
                self.mappings.clear();
            }
        }

        if self.watch_interval_secs == 0 {
            return Err(Error::config("'watchIntervalSecs' must be at least 1"));
        }

        Ok(())
    }
}
