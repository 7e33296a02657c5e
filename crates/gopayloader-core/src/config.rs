//! Run configuration: immutable after validation, shared by the engine and
//! every worker.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

const SUPPORTED_METHODS: [&str; 4] = ["GET", "PUT", "POST", "DELETE"];

/// Which HTTP client implementation drives the connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    FastHttp1,
    NetHttp1,
    NetHttp2,
    NetHttp3,
}

impl ClientKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fasthttp" => Ok(ClientKind::FastHttp1),
            "nethttp1" => Ok(ClientKind::NetHttp1),
            "nethttp2" => Ok(ClientKind::NetHttp2),
            "nethttp3" => Ok(ClientKind::NetHttp3),
            other => Err(Error::Config(format!("client {} not recognised", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::FastHttp1 => "fasthttp",
            ClientKind::NetHttp1 => "nethttp1",
            ClientKind::NetHttp2 => "nethttp2",
            ClientKind::NetHttp3 => "nethttp3",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ClientKind {
    fn default() -> Self {
        ClientKind::FastHttp1
    }
}

/// Everything a load run needs. Built once by the CLI, validated, then
/// handed to the engine behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub req_uri: String,
    pub method: String,
    /// Raw `name:value` pairs as supplied on the command line.
    pub headers: Vec<String>,
    pub body: String,
    pub body_file: Option<PathBuf>,
    pub disable_keep_alive: bool,
    pub skip_verify: bool,
    pub mtls_cert: Option<PathBuf>,
    pub mtls_key: Option<PathBuf>,

    pub reqs: u64,
    pub conns: u32,
    pub duration: Duration,

    pub read_timeout: Duration,
    pub write_timeout: Duration,

    pub client: ClientKind,

    pub jwt_header: String,
    pub jwt_key: Option<PathBuf>,
    pub jwt_kid: String,
    pub jwt_sub: String,
    pub jwt_iss: String,
    pub jwt_aud: String,
    pub jwt_claims: String,
    pub jwts_filename: String,

    pub verbose: bool,
    pub ticker: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            req_uri: String::new(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: String::new(),
            body_file: None,
            disable_keep_alive: false,
            skip_verify: false,
            mtls_cert: None,
            mtls_key: None,
            reqs: 0,
            conns: 1,
            duration: Duration::ZERO,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            client: ClientKind::default(),
            jwt_header: String::new(),
            jwt_key: None,
            jwt_kid: String::new(),
            jwt_sub: String::new(),
            jwt_iss: String::new(),
            jwt_aud: String::new(),
            jwt_claims: String::new(),
            jwts_filename: String::new(),
            verbose: false,
            ticker: Duration::from_secs(1),
        }
    }
}

impl RunConfig {
    /// Regime (a): a fixed number of requests, as fast as they will go.
    pub fn req_limited_only(&self) -> bool {
        self.duration.is_zero() && self.reqs != 0
    }

    /// Regime (b): a fixed time window, unbounded requests.
    pub fn unlimited_reqs(&self) -> bool {
        !self.duration.is_zero() && self.reqs == 0
    }

    /// JWTs get attached to every request, either generated from a key or
    /// read from a user-supplied file.
    pub fn jwt_enabled(&self) -> bool {
        !self.jwt_header.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let uri = Url::parse(&self.req_uri).map_err(|e| {
            Error::Config(format!(
                "invalid request uri {}; {}; expected format scheme://host:port/path",
                self.req_uri, e
            ))
        })?;
        match uri.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Config(format!(
                    "unsupported scheme {}; expected format scheme://host:port/path",
                    other
                )))
            }
        }
        // the parser normalizes explicit default ports (:80/:443) away
        let has_port = uri.port().is_some()
            || match (uri.scheme(), uri.host_str()) {
                ("http", Some(host)) => self.req_uri.contains(&format!("{}:80", host)),
                ("https", Some(host)) => self.req_uri.contains(&format!("{}:443", host)),
                _ => false,
            };
        if uri.host_str().is_none() || !has_port {
            return Err(Error::Config(format!(
                "invalid request uri {}; expected format scheme://host:port/path",
                self.req_uri
            )));
        }

        if !SUPPORTED_METHODS.contains(&self.method.as_str()) {
            return Err(Error::Config(format!(
                "method {} not supported, must be one of GET/PUT/POST/DELETE",
                self.method
            )));
        }

        if self.conns == 0 {
            return Err(Error::Config("need at least one connection".to_string()));
        }
        if self.reqs == 0 && self.duration.is_zero() {
            return Err(Error::Config(
                "both request count and duration are 0, nothing to do".to_string(),
            ));
        }
        if self.reqs != 0 && u64::from(self.conns) > self.reqs {
            return Err(Error::Config(
                "connections can't be more than requests".to_string(),
            ));
        }

        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(Error::Config(
                "read/write timeouts must be greater than 0".to_string(),
            ));
        }

        if !self.body.is_empty() && self.body_file.is_some() {
            return Err(Error::Config(
                "body and body-file are mutually exclusive".to_string(),
            ));
        }
        if let Some(f) = &self.body_file {
            if !f.is_file() {
                return Err(Error::Config(format!(
                    "body file {} does not exist",
                    f.display()
                )));
            }
        }

        for h in &self.headers {
            if h.split_once(':').is_none() {
                return Err(Error::Config(format!(
                    "header {} invalid, expected name:value",
                    h
                )));
            }
        }

        self.validate_mtls()?;
        self.validate_jwt()?;

        if self.verbose && self.ticker.is_zero() {
            return Err(Error::Config("ticker must be greater than 0".to_string()));
        }
        Ok(())
    }

    fn validate_mtls(&self) -> Result<()> {
        match (&self.mtls_cert, &self.mtls_key) {
            (None, None) => Ok(()),
            (Some(cert), Some(key)) => {
                if !cert.is_file() {
                    return Err(Error::Config("mTLS cert does not exist".to_string()));
                }
                if !key.is_file() {
                    return Err(Error::Config(
                        "mTLS private key does not exist".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Err(Error::Config(
                "mTLS cert and key must be specified together".to_string(),
            )),
        }
    }

    fn validate_jwt(&self) -> Result<()> {
        let has_source = self.jwt_key.is_some() || !self.jwts_filename.is_empty();
        if self.jwt_header.is_empty() && has_source {
            return Err(Error::Config(
                "jwt-header must be specified to send jwts".to_string(),
            ));
        }
        if !self.jwt_header.is_empty() && !has_source {
            return Err(Error::Config(
                "jwt-header requires jwt-key or jwts-filename".to_string(),
            ));
        }
        if self.jwt_key.is_some() && !self.jwts_filename.is_empty() {
            return Err(Error::Config(
                "jwt-key and jwts-filename are mutually exclusive".to_string(),
            ));
        }
        if !self.jwt_header.is_empty() && self.reqs == 0 {
            return Err(Error::Config(
                "jwt mode requires a request target (-r)".to_string(),
            ));
        }
        if let Some(key) = &self.jwt_key {
            if !key.is_file() {
                return Err(Error::Config(format!(
                    "jwt private key {} does not exist",
                    key.display()
                )));
            }
        }

        let claim_flags = [
            &self.jwt_kid,
            &self.jwt_sub,
            &self.jwt_iss,
            &self.jwt_aud,
            &self.jwt_claims,
        ];
        if self.jwt_key.is_none() && claim_flags.iter().any(|f| !f.is_empty()) {
            return Err(Error::Config(
                "jwt claim flags require jwt-key".to_string(),
            ));
        }
        if !self.jwt_claims.is_empty() {
            let parsed: serde_json::Value = serde_json::from_str(&self.jwt_claims)
                .map_err(|e| Error::Config(format!("jwt-claims is not valid json; {}", e)))?;
            if !parsed.is_object() {
                return Err(Error::Config(
                    "jwt-claims must be a json object".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Resolve the request body, reading `body_file` if one was given.
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        if let Some(f) = &self.body_file {
            return std::fs::read(f).map_err(Error::from);
        }
        Ok(self.body.clone().into_bytes())
    }
}
