use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Header list that keeps insertion order and looks names up case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  /// Get the first value for a header name.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Set a header, replacing any existing values with the same name.
  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
    self.0.push((name, value.into()));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

impl FromIterator<(String, String)> for Headers {
  fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
    let mut headers = Headers::new();
    for (name, value) in iter {
      headers.0.push((name, value));
    }
    headers
  }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name, value);
    self
  }

  /// Value of the `accept` header, if the page sent one.
  pub fn accept(&self) -> Option<&str> {
    self.headers.get("accept")
  }

  /// Whether the page declared it wants an HTML document.
  pub fn accepts_html(&self) -> bool {
    self.accept().is_some_and(|accept| accept.contains("text/html"))
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Whether this request targets the same scheme/host/port as `origin`.
  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }

  /// Identity of this request inside a store.
  pub fn cache_key(&self) -> String {
    cache_key(&self.url)
  }
}

/// Store key for a URL: the absolute URL without its fragment.
pub fn cache_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

/// A fully buffered response.
///
/// The body lives in memory, so a response can be handed to the page and
/// written to the store from independent clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  #[cfg(test)]
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name, value);
    self
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// 206 Partial Content, which is never written to a store.
  pub fn is_partial(&self) -> bool {
    self.status == 206
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_headers_lookup_is_case_insensitive() {
    let mut headers = Headers::new();
    headers.insert("Content-Type", "text/css");
    assert_eq!(headers.get("content-type"), Some("text/css"));
    assert_eq!(headers.get("CONTENT-TYPE"), Some("text/css"));
    assert_eq!(headers.get("accept"), None);
  }

  #[test]
  fn test_headers_insert_replaces() {
    let mut headers = Headers::new();
    headers.insert("Accept", "*/*");
    headers.insert("accept", "text/html");
    assert_eq!(headers.iter().count(), 1);
    assert_eq!(headers.get("Accept"), Some("text/html"));
  }

  #[test]
  fn test_accepts_html() {
    let page = Request::get(url("http://app.test/plans"))
      .with_header("Accept", "text/html,application/xhtml+xml,*/*;q=0.8");
    assert!(page.accepts_html());

    let script = Request::get(url("http://app.test/static/app.js")).with_header("accept", "*/*");
    assert!(!script.accepts_html());

    let bare = Request::get(url("http://app.test/static/app.js"));
    assert!(!bare.accepts_html());
  }

  #[test]
  fn test_same_origin() {
    let origin = url("http://app.test:5001/");
    let request = Request::get(url("http://app.test:5001/static/mobile.css"));
    assert!(request.is_same_origin(&origin));

    let other_port = Request::get(url("http://app.test:8080/static/mobile.css"));
    assert!(!other_port.is_same_origin(&origin));

    let other_scheme = Request::get(url("https://app.test:5001/"));
    assert!(!other_scheme.is_same_origin(&origin));

    let cdn = Request::get(url("https://cdn.example.com/lib.js"));
    assert!(!cdn.is_same_origin(&origin));
  }

  #[test]
  fn test_cache_key_drops_fragment() {
    assert_eq!(
      cache_key(&url("http://app.test/plans#today")),
      "http://app.test/plans"
    );
    assert_eq!(
      cache_key(&url("http://app.test/plans?week=3")),
      "http://app.test/plans?week=3"
    );
  }

  #[test]
  fn test_response_status_classes() {
    assert!(Response::new(200, "ok").is_ok());
    assert!(Response::new(206, "").is_ok());
    assert!(Response::new(206, "").is_partial());
    assert!(!Response::new(404, "").is_ok());
    assert!(!Response::new(304, "").is_ok());
  }
}
