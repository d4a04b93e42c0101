use std::net::UdpSocket;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Everything a node must know before it talks to anyone: where the
/// bootstrap listens, and whether the whole ring runs on one machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchatConfig {
    pub bootstrap_ip: String,
    pub bootstrap_port: String,
    /// When true every node binds 127.0.0.1; otherwise the node advertises
    /// a routable local address.
    pub local: bool,
}

impl Default for BlockchatConfig {
    fn default() -> Self {
        Self {
            bootstrap_ip: "127.0.0.1".into(),
            bootstrap_port: "5000".into(),
            local: true,
        }
    }
}

impl BlockchatConfig {
    /// Loads from an optional TOML file with `BLOCKCHAT_*` env overrides on
    /// top; missing keys fall back to the defaults above.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("bootstrap_ip", defaults.bootstrap_ip)?
            .set_default("bootstrap_port", defaults.bootstrap_port)?
            .set_default("local", defaults.local)?;
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("BLOCKCHAT"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// The address this node advertises to the ring.
    pub fn advertised_ip(&self) -> String {
        if self.local {
            return self.bootstrap_ip.clone();
        }
        routable_local_ip().unwrap_or_else(|| self.bootstrap_ip.clone())
    }
}

/// Finds the local address the OS would route external traffic from. The
/// socket never sends anything; connect() alone picks the interface.
fn routable_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_single_machine_setup() {
        let cfg = BlockchatConfig::default();
        assert_eq!(cfg.bootstrap_ip, "127.0.0.1");
        assert_eq!(cfg.bootstrap_port, "5000");
        assert!(cfg.local);
    }

    #[test]
    fn load_without_a_file_uses_defaults() {
        let cfg = BlockchatConfig::load(None).unwrap();
        assert_eq!(cfg.bootstrap_port, "5000");
    }

    #[test]
    fn local_mode_advertises_the_bootstrap_ip() {
        let cfg = BlockchatConfig::default();
        assert_eq!(cfg.advertised_ip(), "127.0.0.1");
    }
}
