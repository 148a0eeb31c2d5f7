use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::auth::TokenSource;
use crate::config::Config;

use super::envelope::Envelope;
use super::error::{ApiError, ErrorClass};

/// REST client for the dashboard backend.
///
/// Every response is an [`Envelope`]; failures come back classified.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  tokens: Arc<dyn TokenSource>,
}

impl ApiClient {
  pub fn new(config: &Config, tokens: Arc<dyn TokenSource>) -> color_eyre::Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.api.timeout_secs))
      .gzip(true)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    let base_url = config.api_base_url()?;

    Ok(Self {
      http,
      base_url,
      tokens,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve an endpoint path against the base URL, keeping the base path.
  pub fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url, ApiError> {
    let mut url = self.base_url.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| ApiError::new(ErrorClass::Unknown, "base URL cannot carry a path"))?;
      segments.pop_if_empty();
      segments.extend(path.trim_matches('/').split('/'));
    }
    if !query.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (k, v) in query {
        pairs.append_pair(k, v);
      }
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self.http.request(method, url);
    match self.tokens.token() {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<Option<T>, ApiError> {
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let body = response.bytes().await?;

    match serde_json::from_slice::<Envelope<T>>(&body) {
      Ok(envelope) => envelope.into_data(status),
      Err(_) if !(200..300).contains(&status) => Err(ApiError::from_response(
        status,
        None,
        format!("request failed ({})", status),
      )),
      Err(e) => Err(ApiError::decode(e)),
    }
  }

  pub async fn get<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, String)],
  ) -> Result<T, ApiError> {
    let url = self.endpoint(path, query)?;
    self
      .send::<T>(self.request(Method::GET, url))
      .await?
      .ok_or_else(|| ApiError::new(ErrorClass::Unknown, "response envelope carried no data"))
  }

  pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    path: &str,
    body: &B,
  ) -> Result<Option<T>, ApiError> {
    let url = self.endpoint(path, &[])?;
    self.send(self.request(Method::POST, url).json(body)).await
  }

  pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
    &self,
    path: &str,
    body: &B,
  ) -> Result<Option<T>, ApiError> {
    let url = self.endpoint(path, &[])?;
    self.send(self.request(Method::PUT, url).json(body)).await
  }

  pub async fn patch(&self, path: &str) -> Result<(), ApiError> {
    let url = self.endpoint(path, &[])?;
    self
      .send::<Value>(self.request(Method::PATCH, url))
      .await
      .map(|_| ())
  }

  pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
    let url = self.endpoint(path, &[])?;
    self
      .send::<Value>(self.request(Method::DELETE, url))
      .await
      .map(|_| ())
  }
}
