use std::io::{self, Read};

use bytes::Bytes;
use http::HeaderMap;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{Method, StatusCode};

#[derive(Debug)]
pub(crate) struct DecodeContentEncodingError {
    pub(crate) encoding: String,
    pub(crate) message: String,
}

/// Encoded responses are read up to this multiple of the decoded limit before decoding.
const ENCODED_READ_FACTOR: usize = 4;

pub(crate) fn encoded_read_limit(max_bytes: usize) -> usize {
    max_bytes.saturating_mul(ENCODED_READ_FACTOR)
}

pub(crate) fn has_content_encoding(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .map(str::trim)
                .any(|item| !item.is_empty() && !item.eq_ignore_ascii_case("identity"))
        })
}

/// Decodes into at most `max_bytes`, silently dropping the rest.
///
/// A stream that breaks off is tolerated when the input was already cut short;
/// whatever decoded cleanly up to that point is kept. The returned flag is set when
/// the output may be missing data, so the next layer gets the same allowance.
fn read_to_end_limited<R: Read>(
    reader: &mut R,
    encoding: &str,
    max_bytes: usize,
    input_truncated: bool,
) -> Result<(Vec<u8>, bool), DecodeContentEncodingError> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 8 * 1024];

    loop {
        let read = match reader.read(&mut chunk) {
            Ok(read) => read,
            Err(_) if input_truncated => return Ok((decoded, true)),
            Err(error) => {
                let error: io::Error = error;
                return Err(DecodeContentEncodingError {
                    encoding: encoding.to_owned(),
                    message: error.to_string(),
                });
            }
        };
        if read == 0 {
            return Ok((decoded, input_truncated));
        }
        let remaining = max_bytes - decoded.len();
        if read >= remaining {
            decoded.extend_from_slice(&chunk[..remaining]);
            return Ok((decoded, true));
        }
        decoded.extend_from_slice(&chunk[..read]);
    }
}

pub(crate) fn should_decode_content_encoded_body(
    method: &Method,
    status: StatusCode,
    body_len: usize,
) -> bool {
    if body_len == 0 {
        return false;
    }
    if *method == Method::HEAD {
        return false;
    }
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return false;
    }
    true
}

pub(crate) fn decode_content_encoded_body_limited(
    mut body: Bytes,
    headers: &HeaderMap,
    max_bytes: usize,
    mut input_truncated: bool,
) -> Result<Bytes, DecodeContentEncodingError> {
    let Some(content_encoding) = headers.get(CONTENT_ENCODING) else {
        return Ok(body);
    };
    let content_encoding =
        content_encoding
            .to_str()
            .map_err(|error| DecodeContentEncodingError {
                encoding: "content-encoding".to_owned(),
                message: error.to_string(),
            })?;
    let mut encodings = content_encoding
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();

    while let Some(encoding) = encodings.pop() {
        let (decoded, cut) = match encoding.to_ascii_lowercase().as_str() {
            "identity" => continue,
            "gzip" | "x-gzip" => {
                let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
                read_to_end_limited(&mut decoder, encoding, max_bytes, input_truncated)?
            }
            "deflate" => {
                let mut decoder = flate2::read::ZlibDecoder::new(body.as_ref());
                read_to_end_limited(&mut decoder, encoding, max_bytes, input_truncated)?
            }
            "br" => {
                let mut decoder = brotli::Decompressor::new(body.as_ref(), 4096);
                read_to_end_limited(&mut decoder, encoding, max_bytes, input_truncated)?
            }
            "zstd" => {
                let mut decoder =
                    zstd::stream::read::Decoder::new(body.as_ref()).map_err(|error| {
                        DecodeContentEncodingError {
                            encoding: encoding.to_owned(),
                            message: error.to_string(),
                        }
                    })?;
                read_to_end_limited(&mut decoder, encoding, max_bytes, input_truncated)?
            }
            other => {
                return Err(DecodeContentEncodingError {
                    encoding: other.to_owned(),
                    message: "unsupported content-encoding".to_owned(),
                });
            }
        };
        body = Bytes::from(decoded);
        input_truncated |= cut;
    }

    Ok(body)
}

/// Strips the headers that described the encoded payload once it has been decoded.
pub(crate) fn remove_content_encoding_headers(headers: &mut HeaderMap) {
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
}
