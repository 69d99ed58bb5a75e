//! Network access for the caching core.
//!
//! Everything that leaves the process goes through the [`Network`] trait so the
//! fetch policies, the install step and the sync replayer can be exercised
//! against a fake network in tests.

mod client;
#[cfg(test)]
pub mod fake;
mod types;

use std::time::Duration;

use futures::future::BoxFuture;

pub use client::HttpNetwork;
pub use types::{FetchFailure, Request, Response};

/// A transport capable of performing a single HTTP exchange.
pub trait Network: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchFailure>>;
}

/// Perform a network exchange bounded by `timeout`.
///
/// A hung transport surfaces as [`FetchFailure::Timeout`] so callers can take the
/// same fallback branch they take for a transport error.
pub async fn attempt_network<N>(
  network: &N,
  request: &Request,
  timeout: Duration,
) -> Result<Response, FetchFailure>
where
  N: Network + ?Sized,
{
  match tokio::time::timeout(timeout, network.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(FetchFailure::Timeout(timeout)),
  }
}
