//! Persistence facade and its configuration

mod config;
mod manager;

pub use config::{
    BackendKind, PersistenceConfig, CONFIG_FILE_NAME, DEFAULT_CACHE_SIZE_BYTES,
    MIN_CACHE_SIZE_BYTES,
};
pub use manager::{CacheNode, PersistenceManager};
