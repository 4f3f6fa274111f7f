//! The outbound HTTP seam.
//!
//! Everything the engine needs from the network is behind [`Transport`]:
//! send one request, get back an aggregated response with inspectable
//! headers (redirect location, auth challenge, server date, subscription
//! lease). Tests substitute a canned-response implementation.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use tokio::time::{Duration, timeout};

use crate::common::compression::{decompress_body, detect_encodings};
use crate::common::http::{HyperClient, build_hyper_client};
use crate::error::{Error, Result};

pub trait Transport: Send + Sync + 'static {
    fn send(&self, req: Request<Bytes>) -> impl Future<Output = Result<Response<Bytes>>> + Send;
}

/// Production transport: hyper 1.x + rustls with HTTP/2 pooling, a
/// per-request timeout, and automatic response decompression.
pub struct HyperTransport {
    client: HyperClient,
    request_timeout: Duration,
}

impl HyperTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_hyper_client()?,
            request_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

impl Transport for HyperTransport {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let (parts, body) = req.into_parts();
        let req = Request::from_parts(parts, Full::new(body));

        let fut = self.client.request(req);
        let resp = timeout(self.request_timeout, fut)
            .await
            .map_err(|_| Error::Timeout)??;

        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| Error::Decode(e.to_string()))?
            .to_bytes();
        let encodings = detect_encodings(&parts.headers);
        let body = decompress_body(body, &encodings).await?;

        Ok(Response::from_parts(parts, body))
    }
}
