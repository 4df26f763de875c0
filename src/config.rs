//! Node configuration

use std::net::IpAddr;
use std::path::PathBuf;

use crate::net::types::{
    DEFAULT_OUTBOUND_TARGET, DEFAULT_PORT, MAINNET_MAGIC, REGTEST_MAGIC, TESTNET_MAGIC,
};

/// Which chain the node speaks. Selects the wire magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    Mainnet,
    Testnet,
    Regtest,
}

impl ChainKind {
    pub fn magic(&self) -> [u8; 4] {
        match self {
            ChainKind::Mainnet => MAINNET_MAGIC,
            ChainKind::Testnet => TESTNET_MAGIC,
            ChainKind::Regtest => REGTEST_MAGIC,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind a listening socket.
    pub listen_enabled: bool,
    /// Listen port; 0 binds an ephemeral port.
    pub listen_port: u16,
    /// Reactor ownership: 0 means the embedder (a test) drives the reactor
    /// itself instead of a spawned task.
    pub io_threads: usize,
    /// Four-byte wire magic.
    pub network_magic: [u8; 4],
    /// Start the NAT-refresh side task.
    pub enable_nat: bool,
    /// Directory for anchors.json and banlist.dat.
    pub datadir: PathBuf,
    /// Deterministic local nonce override for tests.
    pub test_nonce: Option<u64>,
    /// Cap on the exponential feeler delay as a multiple of the mean
    /// interval; <= 0 disables the cap.
    pub feeler_max_delay_multiplier: f64,
    /// Desired number of full outbound connections.
    pub outbound_target: usize,
    /// Addresses admitted with NoBan even when discouraged.
    pub whitelist: Vec<IpAddr>,
    /// Operator-supplied seed addresses, dialed at startup.
    pub seeds: Vec<std::net::SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_enabled: true,
            listen_port: DEFAULT_PORT,
            io_threads: 1,
            network_magic: MAINNET_MAGIC,
            enable_nat: false,
            datadir: PathBuf::from("./data"),
            test_nonce: None,
            feeler_max_delay_multiplier: 0.0,
            outbound_target: DEFAULT_OUTBOUND_TARGET,
            whitelist: Vec::new(),
            seeds: Vec::new(),
        }
    }
}

impl Config {
    /// Test-friendly configuration: ephemeral port, regtest magic, no
    /// feeler delay pathologies.
    pub fn regtest(datadir: PathBuf) -> Self {
        Self {
            listen_port: 0,
            network_magic: REGTEST_MAGIC,
            datadir,
            feeler_max_delay_multiplier: 2.0,
            ..Self::default()
        }
    }

    pub fn anchors_path(&self) -> PathBuf {
        self.datadir.join("anchors.json")
    }

    pub fn banlist_path(&self) -> PathBuf {
        self.datadir.join("banlist.dat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_magic_distinct() {
        assert_ne!(ChainKind::Mainnet.magic(), ChainKind::Testnet.magic());
        assert_ne!(ChainKind::Mainnet.magic(), ChainKind::Regtest.magic());
    }

    #[test]
    fn test_paths_under_datadir() {
        let config = Config::regtest(PathBuf::from("/tmp/x"));
        assert_eq!(config.anchors_path(), PathBuf::from("/tmp/x/anchors.json"));
        assert_eq!(config.banlist_path(), PathBuf::from("/tmp/x/banlist.dat"));
    }
}
