use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{HOST, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::trace::{TraceInfo, TraceRecorder};
use crate::util::{parse_header_name, parse_header_value};

/// One outbound call, executed with [`Client::execute`](crate::Client::execute).
///
/// The body is kept as [`Bytes`] so every attempt resends the same payload.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    cancellation_token: CancellationToken,
    attempt: usize,
    trace_enabled: bool,
    trace: Option<Arc<TraceRecorder>>,
    sent_at: Option<Instant>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            cancellation_token: CancellationToken::new(),
            attempt: 0,
            trace_enabled: false,
            trace: None,
            sent_at: None,
        }
    }

    pub fn parse(method: &str, url: &str) -> Result<Self, Error> {
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| Error::InvalidMethod {
            method: method.to_owned(),
        })?;
        let url = Url::parse(url).map_err(|_| Error::InvalidUri {
            uri: url.to_owned(),
        })?;
        Ok(Self::new(method, url))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Replaces any earlier value of `name`.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancellation_token = token;
    }

    /// Records connection timings for the next `execute`; see [`trace_info`](Self::trace_info).
    pub fn enable_trace(&mut self) {
        self.trace_enabled = true;
    }

    pub fn is_trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    /// Number of transport attempts made by the last `execute`.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Start of the latest attempt.
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Timings of the last traced call, available once its body has been read.
    pub fn trace_info(&self) -> Option<TraceInfo> {
        self.trace.as_ref().and_then(|recorder| recorder.info())
    }

    /// HTTP/1.1 rendering of the request as it would be sent, for debugging.
    pub fn to_wire_text(&self) -> String {
        let mut target = self.url.path().to_owned();
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }

        let mut text = format!("{} {target} HTTP/1.1\r\n", self.method);
        if !self.headers.contains_key(HOST)
            && let Some(host) = self.url.host_str()
        {
            match self.url.port() {
                Some(port) => {
                    let _ = write!(text, "Host: {host}:{port}\r\n");
                }
                None => {
                    let _ = write!(text, "Host: {host}\r\n");
                }
            }
        }
        write_headers(&mut text, &self.headers);
        text.push_str("\r\n");
        text.push_str(&String::from_utf8_lossy(&self.body));
        text
    }

    pub(crate) fn begin_execute(&mut self, token: &CancellationToken) {
        self.cancellation_token = token.clone();
        self.attempt = 0;
        self.sent_at = None;
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.sent_at = Some(Instant::now());
    }

    /// Fresh recorder for this call when tracing is on.
    pub(crate) fn install_trace_recorder(&mut self) {
        self.trace = self
            .trace_enabled
            .then(|| Arc::new(TraceRecorder::new()));
    }

    pub(crate) fn trace_recorder(&self) -> Option<&Arc<TraceRecorder>> {
        self.trace.as_ref()
    }
}

pub(crate) fn write_headers(text: &mut String, headers: &HeaderMap) {
    for (name, value) in headers {
        let _ = write!(
            text,
            "{}: {}\r\n",
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes())
        );
    }
}
