//! Test doubles.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::http::{cache_key, Network, Request, Response};

/// Network that answers from a fixed routing table and records every call.
///
/// Unrouted URLs and every URL while offline fail like a refused connection.
#[derive(Default)]
pub struct FakeNetwork {
  routes: HashMap<String, Response>,
  calls: Mutex<Vec<String>>,
  offline: AtomicBool,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(mut self, url: &Url, response: Response) -> Self {
    self.routes.insert(cache_key(url), response);
    self
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls().len()
  }
}

impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let key = cache_key(&request.url);
    self.calls.lock().unwrap().push(key.clone());

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", key));
    }

    let response = self.routes.get(&key).cloned();
    response.ok_or_else(|| eyre!("Failed to fetch {}: connection refused", key))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_fake_network_routes_and_records() {
    let home = Url::parse("http://app.test/").unwrap();
    let network = FakeNetwork::new().route(&home, Response::new(200, "home"));

    let response = network.fetch(&Request::get(home.clone())).await.unwrap();
    assert_eq!(response.body, b"home");

    let missing = Url::parse("http://app.test/nope").unwrap();
    assert!(network.fetch(&Request::get(missing)).await.is_err());

    network.set_offline(true);
    assert!(network.fetch(&Request::get(home)).await.is_err());

    assert_eq!(
      network.calls(),
      vec![
        "http://app.test/".to_string(),
        "http://app.test/nope".to_string(),
        "http://app.test/".to_string()
      ]
    );
  }
}
