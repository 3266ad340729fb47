#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod cast;
pub mod checkpoint;
pub mod config;
pub mod download;
pub mod enclosure;
pub mod error;
pub mod feed;
pub mod handles;
pub mod hub;
pub mod ipfs;
pub mod live;
pub mod logging;
pub mod message;
pub mod publish;
pub mod storage;
#[cfg(test)]
mod testing;
pub mod ui;
pub mod viewport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, Cli};
