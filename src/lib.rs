pub mod chain;
pub mod config;
pub mod net;
pub mod types;

pub use chain::{BLOCK_HEADER_SIZE, BlockHeader, BlockIndex, BlockLocator, ChainState};
pub use config::{ChainKind, Config};
pub use net::{NetStats, NetworkManager};
pub use types::*;
