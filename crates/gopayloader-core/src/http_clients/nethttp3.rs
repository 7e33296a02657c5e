//! HTTP/3 client: one QUIC connection per worker, requests multiplexed on
//! its streams.

use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use h3::client::SendRequest;
use h3_quinn::OpenStreams;
use quinn::Endpoint;
use tokio::net::lookup_host;
use tokio::time::timeout;

use super::{response_size, tls, ClientError, ClientSettings, Request, Response};
use crate::error::{Error, Result};

pub struct H3Client {
    endpoint: Endpoint,
    sender: SendRequest<OpenStreams, Bytes>,
    read_timeout: Duration,
}

impl H3Client {
    pub(crate) async fn connect(settings: ClientSettings) -> Result<Self> {
        if !settings.is_https() {
            return Err(Error::ClientSetup(
                "http/3 requires a https:// target".to_string(),
            ));
        }

        let cfg = tls::client_config(settings.skip_verify, settings.mtls(), &[b"h3"])?;
        let quic_cfg = quinn::crypto::rustls::QuicClientConfig::try_from(cfg)
            .map_err(|e| Error::ClientSetup(format!("quic tls config; {}", e)))?;

        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_cfg)));

        let host = settings.host().to_string();
        let addrs: Vec<SocketAddr> = lookup_host((host.as_str(), settings.port()))
            .await?
            .collect();
        if addrs.is_empty() {
            return Err(Error::ClientSetup(format!(
                "no address found for {}",
                host
            )));
        }

        let mut last_err = None;
        for addr in addrs {
            match Self::open(&endpoint, addr, &host, settings.write_timeout).await {
                Ok(sender) => {
                    return Ok(H3Client {
                        endpoint,
                        sender,
                        read_timeout: settings.read_timeout,
                    })
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::ClientSetup("quic connect failed".to_string())))
    }

    async fn open(
        endpoint: &Endpoint,
        addr: SocketAddr,
        hostname: &str,
        write_timeout: Duration,
    ) -> Result<SendRequest<OpenStreams, Bytes>> {
        let connecting = endpoint
            .connect(addr, hostname)
            .map_err(|e| Error::ClientSetup(format!("quic connect; {}", e)))?;
        let connection = timeout(write_timeout, connecting)
            .await
            .map_err(|_| Error::ClientSetup("quic handshake timeout".to_string()))?
            .map_err(|e| Error::ClientSetup(format!("quic handshake; {}", e)))?;

        let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(connection))
            .await
            .map_err(|e| Error::ClientSetup(format!("h3 setup; {}", e)))?;
        tokio::spawn(async move {
            let _ = poll_fn(|cx| driver.poll_close(cx)).await;
        });
        Ok(sender)
    }

    pub(crate) async fn execute(
        &mut self,
        req: &Request,
        resp: &mut Response,
    ) -> std::result::Result<(), ClientError> {
        let mut request = http::Request::builder()
            .method(req.method().clone())
            .uri(req.url().as_str())
            .body(())
            .map_err(|e| ClientError::Request(e.to_string()))?;
        // host and hop-by-hop headers are carried in h3 pseudo-headers
        let mut headers = req.headers().clone();
        headers.remove(http::header::HOST);
        headers.remove(http::header::CONNECTION);
        *request.headers_mut() = headers;

        let body = req.body().clone();
        let sender = &mut self.sender;
        let exchange = async move {
            let mut stream = sender
                .send_request(request)
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?;
            if !body.is_empty() {
                stream
                    .send_data(body)
                    .await
                    .map_err(|e| ClientError::Request(e.to_string()))?;
            }
            stream
                .finish()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?;

            let response = stream
                .recv_response()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?;
            let (parts, _) = response.into_parts();

            let mut body_len = 0usize;
            while let Some(chunk) = stream
                .recv_data()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?
            {
                body_len += chunk.remaining();
            }
            Ok::<_, ClientError>((parts, body_len))
        };

        let (parts, body_len) = timeout(self.read_timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout("read"))??;

        resp.status = parts.status.as_u16();
        resp.size = response_size(&parts.headers, body_len);
        Ok(())
    }

    pub(crate) fn close_idle(&mut self) {
        self.endpoint.close(0u32.into(), b"done");
    }
}
