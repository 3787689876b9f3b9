//! Request and response middleware.
//!
//! User middleware registered on a [`Client`] runs before the built-in request
//! middleware and after the built-in response middleware, so user code sees raw caller
//! input on the way out and a fully read body on the way back.

use std::time::Duration;

use async_trait::async_trait;
use http::HeaderValue;
use http::header::CONNECTION;
use tokio::time::timeout;

use crate::body::read_body_limited;
use crate::client::Client;
use crate::content_encoding::{
    decode_content_encoded_body_limited, encoded_read_limit, has_content_encoding,
    remove_content_encoding_headers, should_decode_content_encoded_body,
};
use crate::error::{BoxError, CancelPhase, Error, TimeoutPhase};
use crate::request::Request;
use crate::response::Response;
use crate::util::{
    append_cookie_pairs, cookie_names, parse_header_name, parse_header_value, redact_uri_for_logs,
    seconds,
};

pub trait RequestMiddleware: Send + Sync {
    fn handle(&self, request: &mut Request, client: &Client) -> Result<(), BoxError>;
}

impl<F> RequestMiddleware for F
where
    F: Fn(&mut Request, &Client) -> Result<(), BoxError> + Send + Sync,
{
    fn handle(&self, request: &mut Request, client: &Client) -> Result<(), BoxError> {
        self(request, client)
    }
}

#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    async fn handle(&self, response: &mut Response<'_>, client: &Client) -> Result<(), BoxError>;
}

#[async_trait]
impl<F> ResponseMiddleware for F
where
    F: Fn(&mut Response<'_>, &Client) -> Result<(), BoxError> + Send + Sync,
{
    async fn handle(&self, response: &mut Response<'_>, client: &Client) -> Result<(), BoxError> {
        self(response, client)
    }
}

pub(crate) fn verify_request_method(request: &mut Request, client: &Client) -> Result<(), BoxError> {
    if client.options().is_method_allowed(request.method()) {
        return Ok(());
    }
    Err(Box::new(Error::MethodNotAllowed {
        method: request.method().clone(),
    }))
}

/// Applies client defaults the caller did not set, and arms tracing.
pub(crate) fn prepare_request(request: &mut Request, client: &Client) -> Result<(), BoxError> {
    request.install_trace_recorder();
    if client.close_connection() {
        request
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let options = client.options();
    for (name, value) in &options.headers {
        let name = parse_header_name(name)?;
        if request.headers().contains_key(&name) {
            continue;
        }
        let value = parse_header_value(name.as_str(), value)?;
        request.headers_mut().insert(name, value);
    }

    if !options.cookies.is_empty() {
        let present = cookie_names(request.headers());
        let pairs = options
            .cookies
            .iter()
            .filter(|(name, _)| !present.iter().any(|existing| existing == *name))
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        append_cookie_pairs(request.headers_mut(), &pairs)?;
    }
    Ok(())
}

/// Reads the response body once, decoding it when the client asked for compression.
///
/// The read stops early when the call's cancellation token fires.
pub(crate) struct ReadResponseBody;

#[async_trait]
impl ResponseMiddleware for ReadResponseBody {
    async fn handle(&self, response: &mut Response<'_>, client: &Client) -> Result<(), BoxError> {
        let Some(raw_body) = response.take_raw_body() else {
            return Ok(());
        };
        let request = response.request();
        let max_bytes = client.options().max_resp_body_size;
        let decode = response.decode_body() && has_content_encoding(response.headers());
        let read_limit = if decode {
            encoded_read_limit(max_bytes)
        } else {
            max_bytes
        };

        let read = async {
            match seconds(client.options().read_timeout) {
                Some(limit) => timeout(limit, read_body_limited(raw_body, read_limit))
                    .await
                    .map_err(|_| body_timeout(request, limit)),
                None => Ok(read_body_limited(raw_body, read_limit).await),
            }
        };
        let limited = tokio::select! {
            biased;
            _ = request.cancellation_token().cancelled() => {
                return Err(Box::new(Error::Canceled {
                    phase: CancelPhase::ResponseBody,
                    method: request.method().clone(),
                    uri: redact_uri_for_logs(request.url().as_str()),
                    attempts: request.attempt(),
                }));
            }
            read = read => read?,
        }
        .map_err(|source| Error::ReadBody { source })?;

        let body = if decode
            && should_decode_content_encoded_body(
                request.method(),
                response.status(),
                limited.bytes.len(),
            ) {
            let decoded = decode_content_encoded_body_limited(
                limited.bytes,
                response.headers(),
                max_bytes,
                limited.truncated,
            )
            .map_err(|error| Error::DecodeContentEncoding {
                encoding: error.encoding,
                method: request.method().clone(),
                uri: redact_uri_for_logs(response.url().as_str()),
                message: error.message,
            })?;
            remove_content_encoding_headers(response.headers_mut());
            decoded
        } else {
            limited.bytes
        };
        response.set_body(body);

        if let Some(recorder) = request.trace_recorder() {
            recorder.finish(response.remote_addr());
        }
        Ok(())
    }
}

fn body_timeout(request: &Request, limit: Duration) -> Error {
    Error::Timeout {
        phase: TimeoutPhase::ResponseBody,
        timeout_ms: limit.as_millis(),
        method: request.method().clone(),
        uri: redact_uri_for_logs(request.url().as_str()),
        attempts: request.attempt(),
    }
}

/// Emits the full exchange as text when the client runs in debug mode.
pub(crate) struct DumpExchange;

#[async_trait]
impl ResponseMiddleware for DumpExchange {
    async fn handle(&self, response: &mut Response<'_>, client: &Client) -> Result<(), BoxError> {
        if !client.options().debug {
            return Ok(());
        }
        tracing::info!(
            target: "shttp::debug",
            "\n========= Request ===========\n{}\n========= Response ==========\n{}\n",
            response.request().to_wire_text(),
            response.to_wire_text()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use http::header::{CONNECTION, COOKIE, USER_AGENT};

    use super::{prepare_request, verify_request_method};
    use crate::client::Client;
    use crate::error::Error;
    use crate::options::{ClientOptions, DEFAULT_USER_AGENT};
    use crate::request::Request;

    fn client(options: ClientOptions) -> Client {
        Client::new(options, None).expect("client should build")
    }

    #[test]
    fn disallowed_method_is_rejected() {
        let client = client(ClientOptions::default().with_allow_methods(["GET"]));
        let mut request = Request::new(
            Method::POST,
            url::Url::parse("http://localhost/").expect("valid url"),
        );
        let error = verify_request_method(&mut request, &client).expect_err("POST is not allowed");
        match error.downcast_ref::<Error>() {
            Some(Error::MethodNotAllowed { method }) => assert_eq!(*method, Method::POST),
            other => panic!("unexpected middleware error: {other:?}"),
        }
    }

    #[test]
    fn defaults_never_override_caller_values() {
        let client = client(
            ClientOptions::default()
                .with_header("X-Team", "core")
                .with_cookie("session", "default")
                .with_cookie("theme", "dark"),
        );
        let mut request = Request::parse("GET", "http://localhost/").expect("valid request");
        request.set_header("X-Team", "caller").expect("valid header");
        request.set_header("Cookie", "session=caller").expect("valid header");

        prepare_request(&mut request, &client).expect("defaults should apply");
        assert_eq!(
            request.header("x-team").and_then(|value| value.to_str().ok()),
            Some("caller")
        );
        assert_eq!(
            request.headers().get(USER_AGENT).and_then(|value| value.to_str().ok()),
            Some(DEFAULT_USER_AGENT)
        );
        assert_eq!(
            request.headers().get(COOKIE).and_then(|value| value.to_str().ok()),
            Some("session=caller; theme=dark")
        );
        assert!(request.headers().get(CONNECTION).is_none());
    }

    #[test]
    fn close_connection_clients_send_connection_close() {
        let client = client(ClientOptions::default()).with_close_connection(true);
        let mut request = Request::parse("GET", "http://localhost/").expect("valid request");
        request.enable_trace();
        prepare_request(&mut request, &client).expect("defaults should apply");
        assert_eq!(
            request.headers().get(CONNECTION).and_then(|value| value.to_str().ok()),
            Some("close")
        );
        assert!(request.trace_recorder().is_some());
    }
}
