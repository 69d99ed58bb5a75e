//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::net::{Request, Response};

/// Identity of a cached response: the request method plus its absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: Method,
  pub url: Url,
}

impl RequestKey {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
    }
  }

  pub fn of(request: &Request) -> Self {
    Self {
      method: request.method.clone(),
      url: request.url.clone(),
    }
  }

  /// Only GET requests are ever materialized in the cache.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Immutable snapshot of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CachedEntry {
  /// Copy a response for persistence. Error responses are never snapshotted.
  pub fn snapshot(response: &Response) -> Option<Self> {
    if !response.is_success() {
      return None;
    }

    Some(Self {
      status: response.status,
      status_text: response.status_text.clone(),
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at: Utc::now(),
    })
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      status_text: self.status_text.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// A cache generation as seen by status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInfo {
  pub name: String,
  pub entries: usize,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  /// A placeholder produced because neither network nor cache could answer.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live network response
  Network,
  /// Stored entry from a cache generation
  Cache,
  /// Offline page or synthesized placeholder
  Fallback,
}

/// Named, versioned response stores.
///
/// Implementations serialize their own operations; every write is applied
/// atomically so a reader never observes a half-written entry.
pub trait CacheStorage: Send + Sync {
  /// Create the named generation if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Names of all existing generations.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a generation and everything in it. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Store one entry, replacing any previous entry for the key.
  fn put(&self, name: &str, key: &RequestKey, entry: &CachedEntry) -> Result<()>;

  /// Store a batch of entries in a single transaction; all or nothing.
  fn put_all(&self, name: &str, entries: &[(RequestKey, CachedEntry)]) -> Result<()>;

  /// Look a key up in one generation.
  fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Look a key up across all generations, most recently stored first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedEntry>>;

  fn entry_count(&self, name: &str) -> Result<usize>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_snapshot_skips_error_responses() {
    assert!(CachedEntry::snapshot(&Response::text(404, "missing")).is_none());
    assert!(CachedEntry::snapshot(&Response::text(500, "boom")).is_none());

    let entry = CachedEntry::snapshot(&Response::text(200, "ok")).unwrap();
    assert_eq!(entry.to_response().body, b"ok");
    assert_eq!(entry.to_response().header("content-type"), Some("text/plain"));
  }

  #[test]
  fn test_cache_hash_depends_on_method_and_url() {
    let url: Url = "https://app.test/api/lessons".parse().unwrap();
    let get = RequestKey::get(url.clone());
    let post = RequestKey {
      method: Method::POST,
      url: url.clone(),
    };

    assert_eq!(get.cache_hash(), RequestKey::get(url).cache_hash());
    assert_ne!(get.cache_hash(), post.cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
    assert!(get.is_cacheable());
    assert!(!post.is_cacheable());
  }
}
