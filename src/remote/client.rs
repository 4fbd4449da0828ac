use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::ApiPage;
use crate::cache::{ApiFailure, FetchResult};
use crate::config::CollectionConfig;
use crate::paging::{PageBasedSource, Paged};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for one paged collection endpoint.
#[derive(Clone)]
pub struct CollectionClient {
  http: reqwest::Client,
  url: Url,
  page_param: String,
  first_page: u32,
  token: Option<String>,
}

impl CollectionClient {
  pub fn new(config: &CollectionConfig, token: Option<String>) -> Result<Self> {
    let url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid collection url {}: {}", config.url, e))?;

    let http = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .user_agent(concat!("ldc/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      url,
      page_param: config.page_param.clone(),
      first_page: config.first_page,
      token,
    })
  }

  /// A fresh cursor over the collection.
  pub fn paged_source(&self) -> PageBasedSource<Value> {
    let client = self.clone();
    PageBasedSource::with_first_page(self.first_page, move |page| {
      let client = client.clone();
      async move { client.fetch_page(page).await }
    })
  }

  /// Collection url with the page parameter set to `page`.
  pub fn page_url(&self, page: u32) -> Url {
    let mut url = self.url.clone();
    let kept: Vec<(String, String)> = self
      .url
      .query_pairs()
      .filter(|(name, _)| name != self.page_param.as_str())
      .map(|(name, value)| (name.into_owned(), value.into_owned()))
      .collect();

    url
      .query_pairs_mut()
      .clear()
      .extend_pairs(kept)
      .append_pair(&self.page_param, &page.to_string());
    url
  }

  /// Fetch page number `page`. Failures are classified, never returned as `Err`.
  pub async fn fetch_page(&self, page: u32) -> FetchResult<Option<Paged<Value>>> {
    let url = self.page_url(page);
    debug!(%url, "Fetching page");

    let mut request = self.http.get(url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = match request.send().await {
      Ok(response) => response,
      Err(e) => return classify_error(e),
    };

    let status = response.status();
    if !status.is_success() {
      return classify_status(status);
    }

    match response.json::<ApiPage>().await {
      Ok(page) => FetchResult::Success(page.into_paged()),
      Err(e) if e.is_decode() => FetchResult::unknown(eyre!("Failed to parse page: {}", e)),
      Err(e) => classify_error(e),
    }
  }
}

/// Map a transport failure onto the failures the cache distinguishes.
fn classify_error<T>(e: reqwest::Error) -> FetchResult<T> {
  if e.is_connect() || e.is_timeout() {
    FetchResult::ApiError(ApiFailure::NetworkError)
  } else {
    FetchResult::unknown(eyre!("Request failed: {}", e))
  }
}

/// Map an unsuccessful status onto the failures the cache distinguishes.
fn classify_status<T>(status: StatusCode) -> FetchResult<T> {
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchResult::ApiError(ApiFailure::Unauthorized),
    StatusCode::REQUEST_TIMEOUT => FetchResult::ApiError(ApiFailure::NetworkError),
    s if s.is_server_error() => FetchResult::ApiError(ApiFailure::ServiceUnavailable),
    s => FetchResult::unknown(eyre!("Unexpected response status {}", s)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::paging::PagedSource;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  fn config(url: &str) -> CollectionConfig {
    CollectionConfig {
      url: url.to_string(),
      page_param: "page".to_string(),
      first_page: 0,
      key_field: None,
      description: None,
    }
  }

  /// Answers every connection with the next canned `(status line, body)`.
  async fn serve(responses: Vec<(&'static str, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
      for (status, body) in responses {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
          let n = socket.read(&mut buf).await.unwrap();
          if n == 0 {
            break;
          }
          request.extend_from_slice(&buf[..n]);
        }
        let response = format!(
          "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
          status,
          body.len(),
          body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
      }
    });

    format!("http://{}/collections", addr)
  }

  #[test]
  fn test_page_url_appends_param() {
    let client = CollectionClient::new(&config("https://api.example.com/c?type=2"), None).unwrap();
    assert_eq!(
      client.page_url(3).as_str(),
      "https://api.example.com/c?type=2&page=3"
    );
  }

  #[test]
  fn test_page_url_replaces_existing_param() {
    let client =
      CollectionClient::new(&config("https://api.example.com/c?page=9&type=2"), None).unwrap();
    assert_eq!(
      client.page_url(0).as_str(),
      "https://api.example.com/c?type=2&page=0"
    );
  }

  #[test]
  fn test_invalid_url() {
    assert!(CollectionClient::new(&config("::not a url"), None).is_err());
  }

  #[test]
  fn test_classify_status() {
    assert!(matches!(
      classify_status::<()>(StatusCode::UNAUTHORIZED),
      FetchResult::ApiError(ApiFailure::Unauthorized)
    ));
    assert!(matches!(
      classify_status::<()>(StatusCode::FORBIDDEN),
      FetchResult::ApiError(ApiFailure::Unauthorized)
    ));
    assert!(matches!(
      classify_status::<()>(StatusCode::BAD_GATEWAY),
      FetchResult::ApiError(ApiFailure::ServiceUnavailable)
    ));
    assert!(matches!(
      classify_status::<()>(StatusCode::NOT_FOUND),
      FetchResult::UnknownError(_)
    ));
  }

  #[tokio::test]
  async fn test_source_walks_pages() {
    let url = serve(vec![
      (
        "200 OK",
        r#"{"items":[{"id":1},{"id":2}],"hasMore":true,"total":3}"#.to_string(),
      ),
      ("200 OK", r#"{"items":[{"id":3}],"hasMore":false}"#.to_string()),
    ])
    .await;
    let client = CollectionClient::new(&config(&url), None).unwrap();
    let source = client.paged_source();

    match source.next_page().await {
      FetchResult::Success(Some(items)) => assert_eq!(items.len(), 2),
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(source.total_size(), Some(3));
    match source.next_page().await {
      FetchResult::Success(Some(items)) => assert_eq!(items, vec![serde_json::json!({"id": 3})]),
      other => panic!("unexpected {:?}", other),
    }
    assert!(source.is_finished());
  }

  #[tokio::test]
  async fn test_server_error_is_service_unavailable() {
    let url = serve(vec![("503 Service Unavailable", String::new())]).await;
    let client = CollectionClient::new(&config(&url), None).unwrap();
    assert!(matches!(
      client.fetch_page(0).await,
      FetchResult::ApiError(ApiFailure::ServiceUnavailable)
    ));
  }

  #[tokio::test]
  async fn test_malformed_body_is_unknown_error() {
    let url = serve(vec![("200 OK", "not json".to_string())]).await;
    let client = CollectionClient::new(&config(&url), None).unwrap();
    assert!(matches!(
      client.fetch_page(0).await,
      FetchResult::UnknownError(_)
    ));
  }

  #[tokio::test]
  async fn test_refused_connection_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client =
      CollectionClient::new(&config(&format!("http://{}/collections", addr)), None).unwrap();
    assert!(matches!(
      client.fetch_page(0).await,
      FetchResult::ApiError(ApiFailure::NetworkError)
    ));
  }
}
