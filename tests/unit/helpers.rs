use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};

use exdav::{Connection, Transport};

/// One request as the mock transport saw it.
#[derive(Clone, Debug)]
pub struct SentRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SentRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Canned-response transport: pops one queued response per request and
/// records everything it was asked to send.
#[derive(Default)]
pub struct MockTransport {
    responses: Arc<Mutex<VecDeque<Response<Bytes>>>>,
    log: Arc<Mutex<Vec<SentRequest>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, resp: Response<Bytes>) {
        self.responses.lock().unwrap().push_back(resp);
    }

    /// Clones of the queue and log, usable after the transport has moved
    /// into a connection.
    pub fn handles(
        &self,
    ) -> (
        Arc<Mutex<VecDeque<Response<Bytes>>>>,
        Arc<Mutex<Vec<SentRequest>>>,
    ) {
        (self.responses.clone(), self.log.clone())
    }
}

impl Transport for MockTransport {
    async fn send(&self, req: Request<Bytes>) -> exdav::Result<Response<Bytes>> {
        let (parts, body) = req.into_parts();
        self.log.lock().unwrap().push(SentRequest {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
        });
        let queued = self.responses.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| multistatus_response(EMPTY_MULTISTATUS, None)))
    }
}

pub const EMPTY_MULTISTATUS: &str = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:"></D:multistatus>"#;

pub fn multistatus_response(body: &str, content_range: Option<&str>) -> Response<Bytes> {
    let mut builder = Response::builder().status(StatusCode::MULTI_STATUS);
    if let Some(range) = content_range {
        builder = builder.header("Content-Range", range);
    }
    builder
        .body(Bytes::copy_from_slice(body.as_bytes()))
        .unwrap()
}

pub fn status_response(status: u16) -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .body(Bytes::new())
        .unwrap()
}

/// A two-item multistatus the way the server's brief mode emits it.
pub fn two_item_multistatus() -> String {
    r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/ex/Calendar/a.eml</D:href>
    <D:propstat>
      <D:prop><D:displayname>first</D:displayname></D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/ex/Calendar/b.eml</D:href>
    <D:propstat>
      <D:prop><D:displayname>second</D:displayname></D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#
        .to_string()
}

pub fn connection(transport: MockTransport) -> Connection<MockTransport> {
    Connection::with_transport("http://127.0.0.1/ex/", transport).unwrap()
}
