use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;

use crate::config::NetworkConfig;

use super::types::{Headers, Request, Response};

/// Something that can issue a request.
///
/// Any HTTP response, whatever its status, is a success. Only transport
/// failures (DNS, refused connection, reset, timeout) are errors.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Network backed by a reqwest client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let mut builder = reqwest::Client::builder();
    if let Some(secs) = config.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in request.headers.iter() {
      builder = builder.header(name, value);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
