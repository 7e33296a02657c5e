//! HTTP/1.1 and HTTP/2 clients over reqwest, pinned to one pooled
//! connection so each worker drives a single transport.

use super::{response_size, ClientError, ClientSettings, Request, Response};
use crate::error::{Error, Result};

pub struct NetHttpClient {
    client: reqwest::Client,
}

impl NetHttpClient {
    pub(crate) fn new(settings: ClientSettings, http2: bool) -> Result<Self> {
        if http2 && !settings.is_https() {
            return Err(Error::ClientSetup(
                "http/2 requires a https:// target".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tcp_nodelay(true)
            .pool_max_idle_per_host(if settings.disable_keep_alive { 0 } else { 1 })
            .connect_timeout(settings.write_timeout)
            .timeout(settings.read_timeout + settings.write_timeout);

        builder = if http2 {
            builder.http2_prior_knowledge()
        } else {
            builder.http1_only()
        };

        if settings.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some((cert, key)) = settings.mtls() {
            let mut pem = std::fs::read(cert)?;
            pem.extend_from_slice(&std::fs::read(key)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::ClientSetup(format!("mTLS key pair rejected; {}", e)))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| Error::ClientSetup(e.to_string()))?;
        Ok(NetHttpClient { client })
    }

    pub(crate) async fn execute(
        &mut self,
        req: &Request,
        resp: &mut Response,
    ) -> std::result::Result<(), ClientError> {
        let mut builder = self
            .client
            .request(req.method().clone(), req.url().clone())
            .headers(req.headers().clone());
        if !req.body().is_empty() {
            builder = builder.body(req.body().clone());
        }

        let mut response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let header_size = response_size(response.headers(), 0);

        let mut body_len = 0usize;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => body_len += chunk.len(),
                Ok(None) => break,
                Err(e) => return Err(classify(e)),
            }
        }

        resp.status = status;
        resp.size = header_size + body_len as i64;
        Ok(())
    }

    pub(crate) fn close_idle(&mut self) {
        // dropping the client releases its pool; nothing to do eagerly
    }
}

fn classify(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        return ClientError::Timeout("request");
    }
    if e.is_connect() {
        return ClientError::Dial(source_message(&e));
    }
    ClientError::Request(source_message(&e))
}

/// Innermost cause without the request URL, so identical failures collapse
/// to one histogram bucket.
fn source_message(e: &reqwest::Error) -> String {
    use std::error::Error as _;

    let mut cause: &(dyn std::error::Error + 'static) = e;
    while let Some(next) = cause.source() {
        cause = next;
    }
    cause.to_string()
}
