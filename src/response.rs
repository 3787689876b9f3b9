use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use crate::body::ResBody;
use crate::error::Error;
use crate::request::{Request, write_headers};
use crate::transport::ConnectionInfo;
use crate::util::truncate_body;

/// Outcome of [`Client::execute`](crate::Client::execute), tied to the request it answers.
///
/// By the time the caller sees it the body has been read, capped at
/// `max_resp_body_size`.
pub struct Response<'r> {
    request: &'r Request,
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Url,
    connection: Option<ConnectionInfo>,
    raw_body: Option<ResBody>,
    decode_body: bool,
    body: Bytes,
    received_at: Instant,
}

impl fmt::Debug for Response<'_> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl<'r> Response<'r> {
    pub(crate) fn new(
        request: &'r Request,
        url: Url,
        response: http::Response<ResBody>,
        decode_body: bool,
    ) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            request,
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            url,
            connection: parts.extensions.get::<ConnectionInfo>().copied(),
            raw_body: Some(body),
            decode_body,
            body: Bytes::new(),
            received_at: Instant::now(),
        }
    }

    pub fn request(&self) -> &'r Request {
        self.request
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// URL of the hop that produced this reply, after any redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Time from the start of the final attempt to the arrival of the response head.
    pub fn latency(&self) -> Duration {
        self.request
            .sent_at()
            .map(|sent_at| self.received_at.saturating_duration_since(sent_at))
            .unwrap_or_default()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection.and_then(|info| info.remote_addr)
    }

    pub fn to_wire_text(&self) -> String {
        let mut text = format!("{:?} {}\r\n", self.version, self.status);
        write_headers(&mut text, &self.headers);
        text.push_str("\r\n");
        text.push_str(&String::from_utf8_lossy(&self.body));
        text
    }

    pub(crate) fn take_raw_body(&mut self) -> Option<ResBody> {
        self.raw_body.take()
    }

    pub(crate) fn decode_body(&self) -> bool {
        self.decode_body
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}
