// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::session::SessionTimeouts;

/// Top-level configuration (§6 "Transport configuration"): where to listen
/// and how long a session may sit idle before the server gives up on it.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    pub transport: TransportConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportConfig {
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TcpConfig {
    pub listen_addr: String,
    pub max_packet_length: usize,
    #[serde(with = "serde_secs")]
    pub idle_timeout: Duration,
    #[serde(with = "serde_secs")]
    pub packet_timeout: Duration,
    #[serde(with = "serde_secs")]
    pub session_timeout: Duration,
    #[serde(with = "serde_secs")]
    pub linger: Duration,
}

impl TcpConfig {
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts { idle: self.idle_timeout, packet_assembly: self.packet_timeout, session: self.session_timeout }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().with_context(|| format!("invalid tcp.listen_addr {:?}", self.listen_addr))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UdpConfig {
    pub listen_addr: String,
    pub max_packet_length: usize,
    #[serde(with = "serde_secs")]
    pub idle_timeout: Duration,
    #[serde(with = "serde_secs")]
    pub packet_timeout: Duration,
    #[serde(with = "serde_secs")]
    pub session_timeout: Duration,
}

impl UdpConfig {
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts { idle: self.idle_timeout, packet_assembly: self.packet_timeout, session: self.session_timeout }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().with_context(|| format!("invalid udp.listen_addr {:?}", self.listen_addr))
    }
}

/// Settings outside the wire protocol: how many concurrent sessions the
/// process is willing to hold open.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    pub max_sessions: u32,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants; the wire defaults of §6 (port 31000, 600-byte
    /// max frame, 4s/1s/5s/5s TCP timeouts, 60s UDP session timeout) live in
    /// the shipped YAML, not as hardcoded fallbacks here.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.runtime.max_sessions >= 1, "runtime.max_sessions must be >= 1");

        for (label, max_len) in [("tcp", self.transport.tcp.max_packet_length), ("udp", self.transport.udp.max_packet_length)] {
            ensure!(max_len >= 3, "{label}.max_packet_length must fit at least a header+type+length");
            ensure!(max_len <= 65536, "{label}.max_packet_length is implausibly large");
        }

        self.transport.tcp.socket_addr().context("transport.tcp.listen_addr")?;
        self.transport.udp.socket_addr().context("transport.udp.listen_addr")?;

        ensure!(self.transport.tcp.idle_timeout > Duration::ZERO, "tcp.idle_timeout must be positive");
        ensure!(self.transport.tcp.session_timeout > Duration::ZERO, "tcp.session_timeout must be positive");
        ensure!(self.transport.udp.idle_timeout > Duration::ZERO, "udp.idle_timeout must be positive");
        ensure!(self.transport.udp.session_timeout > Duration::ZERO, "udp.session_timeout must be positive");

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
transport:
  tcp:
    listen_addr: "0.0.0.0:31000"
    max_packet_length: 600
    idle_timeout: 4
    packet_timeout: 1
    session_timeout: 5
    linger: 5
  udp:
    listen_addr: "0.0.0.0:31000"
    max_packet_length: 600
    idle_timeout: 4
    packet_timeout: 1
    session_timeout: 60
runtime:
  max_sessions: 10000
"#
    }

    #[test]
    fn parses_and_validates_the_shipped_defaults() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).expect("valid yaml");
        cfg.validate_and_normalize().expect("defaults are valid");
        assert_eq!(cfg.transport.tcp.max_packet_length, 600);
        assert_eq!(cfg.transport.udp.session_timeout, Duration::from_secs(60));
    }

    #[test]
    fn rejects_an_unparseable_listen_address() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).expect("valid yaml");
        cfg.transport.tcp.listen_addr = "not-an-address".into();
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn rejects_zero_max_sessions() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).expect("valid yaml");
        cfg.runtime.max_sessions = 0;
        assert!(cfg.validate_and_normalize().is_err());
    }
}
