use std::convert::Infallible;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Request};
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use http_body_util::{BodyExt, Full};
use url::Url;

use crate::error::{BoxError, Error};

/// Request body handed to a [`Transport`](crate::Transport).
pub type ReqBody = BoxBody<Bytes, BoxError>;

/// Unread response body returned by a [`Transport`](crate::Transport).
pub type ResBody = UnsyncBoxBody<Bytes, BoxError>;

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

pub(crate) fn buffered_req_body(body: Bytes) -> ReqBody {
    Full::new(body).map_err(map_infallible_to_box_error).boxed()
}

/// Wraps fully buffered bytes as a response body, for transports that do not stream.
pub fn full_res_body(body: impl Into<Bytes>) -> ResBody {
    Full::new(body.into())
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}

pub(crate) fn build_http_request(
    method: Method,
    url: &Url,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Request<ReqBody>, Error> {
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::InvalidUri {
            uri: url.to_string(),
        });
    }
    let mut request_builder = Request::builder().method(method).uri(url.as_str());
    for (name, value) in headers {
        request_builder = request_builder.header(name, value);
    }
    request_builder
        .body(buffered_req_body(body))
        .map_err(|source| Error::RequestBuild { source })
}

/// Body bytes read up to a limit; `truncated` is set when data beyond the limit was discarded.
#[derive(Debug)]
pub(crate) struct LimitedBody {
    pub(crate) bytes: Bytes,
    pub(crate) truncated: bool,
}

/// Reads at most `max_bytes` from `body` and drops the rest of the stream.
pub(crate) async fn read_body_limited(
    mut body: ResBody,
    max_bytes: usize,
) -> Result<LimitedBody, BoxError> {
    let mut collected = BytesMut::new();
    let mut truncated = false;

    while let Some(frame) = body.frame().await {
        let frame = frame?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        let remaining = max_bytes.saturating_sub(collected.len());
        if data.len() > remaining {
            collected.extend_from_slice(&data[..remaining]);
            truncated = true;
            break;
        }
        collected.extend_from_slice(&data);
    }
    drop(body);

    Ok(LimitedBody {
        bytes: collected.freeze(),
        truncated,
    })
}
