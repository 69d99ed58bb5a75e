//! Cache store and fetch interception for offline support.
//!
//! This module provides:
//! - Named, versioned cache generations keyed by request identity
//! - Network-first and cache-first fetch policies with offline fallbacks
//! - A SQLite backend that also persists the sync queue and lifecycle state

mod layer;
mod storage;
mod traits;

pub use layer::{
  not_found_response, offline_json_response, offline_text_response, FetchDecision,
  FetchInterceptor, RequestClass, OFFLINE_MESSAGE,
};
pub use storage::SqliteStorage;
pub use traits::{CacheResult, CacheSource, CacheStorage, CachedEntry, GenerationInfo, RequestKey};
