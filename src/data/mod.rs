//! Captured event data: the per-peer buffer and network event shaping

mod buffer;
mod network;

pub use buffer::*;
pub use network::*;
