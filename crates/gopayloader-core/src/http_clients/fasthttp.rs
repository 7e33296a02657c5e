//! Low-level HTTP/1.1 client: one handshaked connection per worker, rebuilt
//! only when keep-alive is off or the peer hangs up.

use std::sync::Arc;

use bytes::Bytes;
use http::header::HOST;
use http::HeaderValue;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::{response_size, tls, ClientError, ClientSettings, Request, Response};
use crate::error::{Error, Result};

pub struct FastHttpClient {
    settings: ClientSettings,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    host_header: HeaderValue,
    sender: Option<SendRequest<Full<Bytes>>>,
}

impl FastHttpClient {
    pub(crate) fn new(settings: ClientSettings) -> Result<Self> {
        let tls = if settings.is_https() {
            let cfg = tls::client_config(settings.skip_verify, settings.mtls(), &[b"http/1.1"])?;
            let name = ServerName::try_from(settings.host().to_string())
                .map_err(|e| Error::ClientSetup(format!("invalid server name; {}", e)))?;
            Some((TlsConnector::from(Arc::new(cfg)), name))
        } else {
            None
        };
        let host_header = HeaderValue::from_str(&format!(
            "{}:{}",
            settings.host(),
            settings.port()
        ))
        .map_err(|e| Error::ClientSetup(format!("invalid host header; {}", e)))?;
        Ok(FastHttpClient {
            settings,
            tls,
            host_header,
            sender: None,
        })
    }

    async fn handshake(&self) -> std::result::Result<SendRequest<Full<Bytes>>, ClientError> {
        let addr = (self.settings.host().to_string(), self.settings.port());
        let stream = timeout(self.settings.write_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout("dial"))?
            .map_err(|e| ClientError::Dial(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        match &self.tls {
            Some((connector, name)) => {
                let stream = timeout(
                    self.settings.write_timeout,
                    connector.connect(name.clone(), stream),
                )
                .await
                .map_err(|_| ClientError::Timeout("tls handshake"))?
                .map_err(|e| ClientError::Tls(e.to_string()))?;
                let (sender, conn) = http1::handshake(TokioIo::new(stream))
                    .await
                    .map_err(|e| ClientError::Dial(e.to_string()))?;
                tokio::spawn(async move {
                    let _ = conn.await;
                });
                Ok(sender)
            }
            None => {
                let (sender, conn) = http1::handshake(TokioIo::new(stream))
                    .await
                    .map_err(|e| ClientError::Dial(e.to_string()))?;
                tokio::spawn(async move {
                    let _ = conn.await;
                });
                Ok(sender)
            }
        }
    }

    pub(crate) async fn execute(
        &mut self,
        req: &Request,
        resp: &mut Response,
    ) -> std::result::Result<(), ClientError> {
        let mut sender = match self.sender.take() {
            Some(s) if !s.is_closed() => s,
            _ => self.handshake().await?,
        };

        let mut request = http::Request::builder()
            .method(req.method().clone())
            .uri(req.path_and_query())
            .body(Full::new(req.body().clone()))
            .map_err(|e| ClientError::Request(e.to_string()))?;
        *request.headers_mut() = req.headers().clone();
        if !request.headers().contains_key(HOST) {
            request
                .headers_mut()
                .insert(HOST, self.host_header.clone());
        }

        let exchange = async {
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?;
            let (parts, mut body) = response.into_parts();
            let mut body_len = 0usize;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| ClientError::Request(e.to_string()))?;
                if let Some(data) = frame.data_ref() {
                    body_len += data.len();
                }
            }
            Ok::<_, ClientError>((parts, body_len))
        };

        let (parts, body_len) = timeout(self.settings.read_timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout("read"))??;

        resp.status = parts.status.as_u16();
        resp.size = response_size(&parts.headers, body_len);

        if !self.settings.disable_keep_alive {
            self.sender = Some(sender);
        }
        Ok(())
    }

    pub(crate) fn close_idle(&mut self) {
        self.sender = None;
    }
}
