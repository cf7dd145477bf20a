//! Engine and protocol configuration

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Keepalive probing for idle connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Quiet period before the first probe
    pub idle: Duration,
    /// Gap between unanswered probes
    pub interval: Duration,
    /// Unanswered probes tolerated before the connection is reset
    pub probes: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(7200),
            interval: Duration::from_secs(75),
            probes: 9,
        }
    }
}

/// Protocol tunables for every connection on an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    /// Largest payload we accept per segment, advertised in the MSS option
    pub mss: u16,
    /// Receive buffer capacity in bytes; also the window ceiling
    pub recv_buffer: usize,
    /// Send buffer capacity in bytes (unsent plus unacknowledged)
    pub send_buffer: usize,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Retransmissions of one segment before the connection is aborted
    pub max_retries: u32,
    /// TimeWait linger (2 * MSL)
    pub time_wait: Duration,
    /// Idle time tolerated in FinWait2 before giving up on the peer's FIN
    pub fin_wait2_timeout: Duration,
    pub max_connections: usize,
    /// Pending plus not-yet-accepted connections per listening port
    pub backlog: usize,
    pub keepalive: Option<KeepaliveConfig>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            recv_buffer: 65535,
            send_buffer: 65535,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            max_retries: 5,
            time_wait: Duration::from_secs(60),
            fin_wait2_timeout: Duration::from_secs(60),
            max_connections: 1024,
            backlog: 128,
            keepalive: Some(KeepaliveConfig::default()),
        }
    }
}

impl TcpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mss == 0 {
            return Err(Error::Config("mss must be non-zero".into()));
        }
        if self.recv_buffer == 0 || self.send_buffer == 0 {
            return Err(Error::Config("buffer sizes must be non-zero".into()));
        }
        if self.recv_buffer > u16::MAX as usize {
            // No window scaling, so the window field caps what we can use
            return Err(Error::Config(format!(
                "recv_buffer {} exceeds the 65535-byte window",
                self.recv_buffer
            )));
        }
        if self.min_rto > self.max_rto || self.initial_rto > self.max_rto {
            return Err(Error::Config("rto bounds are inverted".into()));
        }
        if self.fin_wait2_timeout.is_zero() {
            return Err(Error::Config("fin_wait2_timeout must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be non-zero".into()));
        }
        Ok(())
    }
}

/// Everything the engine needs to start
#[derive(Debug, Clone)]
pub struct Config {
    pub tun_name: String,
    /// Address treated as our own for demultiplexing and outbound headers
    pub local_addr: Ipv4Addr,
    pub listen: Vec<u16>,
    pub tcp: TcpConfig,
}

impl Config {
    pub fn new(local_addr: Ipv4Addr) -> Self {
        Self {
            tun_name: "tun0".to_string(),
            local_addr,
            listen: Vec::new(),
            tcp: TcpConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_addr.is_unspecified() || self.local_addr.is_broadcast() {
            return Err(Error::Config(format!(
                "{} cannot be used as the local address",
                self.local_addr
            )));
        }
        if self.listen.contains(&0) {
            return Err(Error::Config("cannot listen on port 0".into()));
        }
        self.tcp.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::new(Ipv4Addr::new(192, 168, 1, 2));
        assert!(config.validate().is_ok());
        assert_eq!(config.tun_name, "tun0");
    }

    #[test]
    fn test_rejects_unusable_local_addr() {
        let config = Config::new(Ipv4Addr::UNSPECIFIED);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_oversized_window() {
        let tcp = TcpConfig {
            recv_buffer: 1 << 20,
            ..TcpConfig::default()
        };
        assert!(matches!(tcp.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_fin_wait2_timeout() {
        let tcp = TcpConfig {
            fin_wait2_timeout: Duration::ZERO,
            ..TcpConfig::default()
        };
        assert!(matches!(tcp.validate(), Err(Error::Config(_))));
    }
}
