//! Uniform request/response contract over the HTTP/1.1, HTTP/2 and HTTP/3
//! implementations. One client drives exactly one transport; HTTP/2 and
//! HTTP/3 multiplex requests on that single connection.

pub(crate) mod fasthttp;
pub(crate) mod nethttp;
pub(crate) mod nethttp3;
pub(crate) mod tls;

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use thiserror::Error;
use url::Url;

use crate::config::{ClientKind, RunConfig};
use crate::error::{Error as CoreError, Result as CoreResult};

/// Per-request failure. Workers histogram the rendered message and carry on;
/// these never abort a run.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("dial: {0}")]
    Dial(String),

    #[error("tls handshake: {0}")]
    Tls(String),

    #[error("{0} timeout")]
    Timeout(&'static str),

    #[error("request: {0}")]
    Request(String),
}

/// Connection-level settings shared by every client variant.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    url: Url,
    pub disable_keep_alive: bool,
    pub skip_verify: bool,
    pub mtls_cert: Option<PathBuf>,
    pub mtls_key: Option<PathBuf>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl ClientSettings {
    pub fn from_config(cfg: &RunConfig) -> CoreResult<Self> {
        let url = Url::parse(&cfg.req_uri)
            .map_err(|e| CoreError::Config(format!("invalid request uri; {}", e)))?;
        Ok(ClientSettings {
            url,
            disable_keep_alive: cfg.disable_keep_alive,
            skip_verify: cfg.skip_verify,
            mtls_cert: cfg.mtls_cert.clone(),
            mtls_key: cfg.mtls_key.clone(),
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
        })
    }

    pub(crate) fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub(crate) fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub(crate) fn port(&self) -> u16 {
        // validation requires an explicit port
        self.url.port().unwrap_or(if self.is_https() { 443 } else { 80 })
    }

    pub(crate) fn mtls(&self) -> Option<(&Path, &Path)> {
        match (&self.mtls_cert, &self.mtls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Reusable request prototype. A worker builds one up front and mutates only
/// per-request headers (e.g. the JWT) between sends.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn set_header(&mut self, key: &str, val: &str) -> CoreResult<()> {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| CoreError::Config(format!("invalid header name {}; {}", key, e)))?;
        let value = HeaderValue::from_str(val)
            .map_err(|e| CoreError::Config(format!("invalid header value for {}; {}", key, e)))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// On-wire size estimate: header names + values + separators + body.
    pub fn size(&self) -> i64 {
        let mut size = self.body.len() + 2;
        for (name, value) in &self.headers {
            size += name.as_str().len() + value.len() + 2;
        }
        size as i64
    }

    pub(crate) fn method(&self) -> &Method {
        &self.method
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn body(&self) -> &Bytes {
        &self.body
    }

    /// Request target in origin form, for clients that speak to an already
    /// connected host.
    pub(crate) fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }
}

/// Filled in by `Client::execute`; `release` resets it for the next
/// exchange. Bodies are always drained before this is populated.
#[derive(Debug, Default)]
pub struct Response {
    pub(crate) status: u16,
    pub(crate) size: i64,
}

impl Response {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn release(&mut self) {
        self.status = 0;
        self.size = 0;
    }
}

/// Response size estimate mirroring `Request::size`.
pub(crate) fn response_size(headers: &HeaderMap, body_len: usize) -> i64 {
    let mut size = body_len + 2;
    for (name, value) in headers {
        size += name.as_str().len() + value.len() + 2;
    }
    size as i64
}

/// The client variants behind the shared contract. Dispatch happens once at
/// construction; each variant is pinned to a single connection.
pub enum Client {
    FastHttp1(fasthttp::FastHttpClient),
    NetHttp(nethttp::NetHttpClient),
    NetHttp3(nethttp3::H3Client),
}

impl Client {
    pub async fn connect(kind: ClientKind, settings: ClientSettings) -> CoreResult<Self> {
        match kind {
            ClientKind::FastHttp1 => Ok(Client::FastHttp1(fasthttp::FastHttpClient::new(
                settings,
            )?)),
            ClientKind::NetHttp1 => {
                Ok(Client::NetHttp(nethttp::NetHttpClient::new(settings, false)?))
            }
            ClientKind::NetHttp2 => {
                Ok(Client::NetHttp(nethttp::NetHttpClient::new(settings, true)?))
            }
            ClientKind::NetHttp3 => Ok(Client::NetHttp3(
                nethttp3::H3Client::connect(settings).await?,
            )),
        }
    }

    /// One exchange. The connection is reused when keep-alive is enabled.
    pub async fn execute(
        &mut self,
        req: &Request,
        resp: &mut Response,
    ) -> Result<(), ClientError> {
        match self {
            Client::FastHttp1(c) => c.execute(req, resp).await,
            Client::NetHttp(c) => c.execute(req, resp).await,
            Client::NetHttp3(c) => c.execute(req, resp).await,
        }
    }

    /// Release any pooled sockets; called by a worker on completion.
    pub fn close_idle(&mut self) {
        match self {
            Client::FastHttp1(c) => c.close_idle(),
            Client::NetHttp(c) => c.close_idle(),
            Client::NetHttp3(c) => c.close_idle(),
        }
    }
}

/// Build the request prototype a worker reuses for every iteration.
pub fn build_request(cfg: &RunConfig) -> CoreResult<Request> {
    let url = Url::parse(&cfg.req_uri)
        .map_err(|e| CoreError::Config(format!("invalid request uri; {}", e)))?;
    let method: Method = cfg
        .method
        .parse()
        .map_err(|_| CoreError::Config(format!("method {} not supported", cfg.method)))?;

    let mut req = Request::new(method, url);

    // "Connection: close" is an HTTP/1 concept; h2/h3 reject it.
    if cfg.disable_keep_alive
        && matches!(cfg.client, ClientKind::FastHttp1 | ClientKind::NetHttp1)
    {
        req.set_header("connection", "close")?;
    }

    for h in &cfg.headers {
        let (name, value) = h
            .split_once(':')
            .ok_or_else(|| CoreError::Config(format!("header {} invalid", h)))?;
        req.set_header(name.trim(), value.trim())?;
    }

    let body = cfg.body_bytes()?;
    if !body.is_empty() {
        req.set_body(body);
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_size_counts_headers_and_body() {
        let url = Url::parse("http://localhost:8080/").unwrap();
        let mut req = Request::new(Method::POST, url);
        req.set_header("a", "bc").unwrap();
        req.set_body("hello".as_bytes().to_vec());
        // header 1+2+2, separator 2, body 5
        assert_eq!(req.size(), 12);
    }

    #[test]
    fn build_request_applies_headers_and_keep_alive() {
        let cfg = RunConfig {
            req_uri: "http://localhost:9090/path?x=1".to_string(),
            headers: vec!["X-Test: yes".to_string()],
            disable_keep_alive: true,
            ..Default::default()
        };
        let req = build_request(&cfg).unwrap();
        assert_eq!(req.headers().get("x-test").unwrap(), "yes");
        assert_eq!(req.headers().get("connection").unwrap(), "close");
        assert_eq!(req.path_and_query(), "/path?x=1");
    }

    #[test]
    fn keep_alive_header_skipped_for_h2() {
        let cfg = RunConfig {
            req_uri: "https://localhost:9090/".to_string(),
            disable_keep_alive: true,
            client: ClientKind::NetHttp2,
            ..Default::default()
        };
        let req = build_request(&cfg).unwrap();
        assert!(req.headers().get("connection").is_none());
    }
}
