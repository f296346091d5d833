//! tandem recorder
//!
//! Keeps a single logical interaction recording alive while the user moves
//! between several peers (tabs, windows, processes) that share one registry.
//! Peers elect a primary recorder, hand the recording over on teardown, and
//! deliver their buffered events to a remote collector in batches.

pub mod config;
pub mod coordinator;
pub mod data;
pub mod ids;
pub mod logging;
pub mod recording;
pub mod registry;
pub mod upload;
