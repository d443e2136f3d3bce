#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cleaner;
pub mod cluster;
pub mod config;
pub mod creator;
pub mod error;
pub mod index;
pub mod loader;
pub mod pattern;
pub mod rollover;
pub mod service;
pub mod stats;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
