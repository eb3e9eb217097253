//! HTTP-shaped responses with explicit copy semantics.
//!
//! Every layer of the gateway (storage, engine, cache, coordinator) trades
//! in [`Response`] values. A response is backed either by a finite in-memory
//! buffer, which can be copied freely, or by a one-shot byte stream, which
//! can be consumed exactly once. The cache refuses to store anything that
//! cannot be copied.

use std::io;
use std::pin::Pin;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use snafu::Snafu;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// Synthetic status emitted when the client abandons the request.
pub fn status_client_closed() -> StatusCode {
    StatusCode::from_u16(499).expect("499 is in the valid status range")
}

/// Errors from response body handling.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ResponseError {
    /// The body is a stream that has not been buffered, so it cannot be
    /// copied without consuming it.
    #[snafu(display("response body is an unbuffered stream"))]
    NotBuffered,

    /// The one-shot stream was already consumed.
    #[snafu(display("response stream already consumed"))]
    StreamConsumed,

    /// Reading the stream failed.
    #[snafu(display("failed to read response stream: {source}"))]
    StreamRead { source: io::Error },
}

/// Body of a [`Response`].
///
/// `Buffer` bodies copy freely; a `Stream` body is consumed exactly once
/// and becomes `Consumed` afterwards.
pub enum Body {
    /// Finite in-memory payload.
    Buffer(Bytes),
    /// One-shot byte stream (e.g. an open file).
    Stream(Pin<Box<dyn AsyncRead + Send>>),
    /// A stream that has already been handed off.
    Consumed,
    /// No payload.
    Empty,
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            Body::Stream(_) => write!(f, "Stream"),
            Body::Consumed => write!(f, "Consumed"),
            Body::Empty => write!(f, "Empty"),
        }
    }
}

/// A response flowing through the gateway.
///
/// Non-2xx responses carry an error message describing why they were
/// produced; errors flow as values, never as unwound control flow.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    content_length: Option<u64>,
    body: Body,
    error: Option<String>,
}

impl Response {
    /// Response backed by an in-memory buffer.
    pub fn buffer(status: StatusCode, content_type: &str, payload: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        let len = payload.len() as u64;
        Self {
            status,
            headers,
            content_length: Some(len),
            body: Body::Buffer(payload),
            error: None,
        }
    }

    /// Response backed by a one-shot stream of known length.
    pub fn stream(
        status: StatusCode,
        content_type: &str,
        len: Option<u64>,
        reader: Pin<Box<dyn AsyncRead + Send>>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        Self {
            status,
            headers,
            content_length: len,
            body: Body::Stream(reader),
            error: None,
        }
    }

    /// Body-less response (HEAD results, storage acks).
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            content_length: None,
            body: Body::Empty,
            error: None,
        }
    }

    /// Error response with an attached message.
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status,
            headers: HeaderMap::new(),
            content_length: None,
            body: Body::Empty,
            error: Some(message),
        }
    }

    /// Plain-text response, used for the S3 location constraint document.
    pub fn text(status: StatusCode, content_type: &str, text: impl Into<String>) -> Self {
        Self::buffer(status, content_type, Bytes::from(text.into()))
    }

    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Override the status, keeping headers and body. Used when a cached
    /// placeholder is served under a new error status.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Set a header from string parts, dropping invalid names or values.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(header = name, "dropping invalid header override"),
        }
    }

    /// Payload length, when known.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Record the payload length for body-less responses (HEAD results).
    pub fn set_content_length(&mut self, len: u64) {
        self.content_length = Some(len);
    }

    /// Content-Type header value, if present and valid UTF-8.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Whether the payload is an image, judged by Content-Type.
    pub fn is_image(&self) -> bool {
        self.content_type()
            .map(|ct| ct.starts_with("image/"))
            .unwrap_or(false)
    }

    /// Whether an error is attached.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// The attached error message, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Produce an independent response over the same underlying buffer.
    ///
    /// Succeeds for buffered, empty and error responses. Fails for stream
    /// bodies, which must be buffered first with [`Response::buffer_body`].
    pub fn try_copy(&self) -> Result<Response, ResponseError> {
        let body = match &self.body {
            Body::Buffer(bytes) => Body::Buffer(bytes.clone()),
            Body::Empty => Body::Empty,
            Body::Stream(_) => return NotBufferedSnafu.fail(),
            Body::Consumed => return StreamConsumedSnafu.fail(),
        };
        Ok(Response {
            status: self.status,
            headers: self.headers.clone(),
            content_length: self.content_length,
            body,
            error: self.error.clone(),
        })
    }

    /// Drain a stream body into an in-memory buffer, making the response
    /// copyable. No-op for non-stream bodies.
    pub async fn buffer_body(&mut self) -> Result<(), ResponseError> {
        if let Body::Stream(_) = self.body {
            let Body::Stream(mut reader) = std::mem::replace(&mut self.body, Body::Consumed)
            else {
                return StreamConsumedSnafu.fail();
            };
            let mut buf = Vec::with_capacity(self.content_length.unwrap_or(0) as usize);
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|source| ResponseError::StreamRead { source })?;
            self.content_length = Some(buf.len() as u64);
            self.body = Body::Buffer(Bytes::from(buf));
        }
        Ok(())
    }

    /// Consume the response and return its payload bytes.
    ///
    /// This is the single allowed read of a stream body.
    pub async fn into_bytes(self) -> Result<Bytes, ResponseError> {
        match self.body {
            Body::Buffer(bytes) => Ok(bytes),
            Body::Empty => Ok(Bytes::new()),
            Body::Consumed => StreamConsumedSnafu.fail(),
            Body::Stream(mut reader) => {
                let mut buf = Vec::with_capacity(self.content_length.unwrap_or(0) as usize);
                reader
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|source| ResponseError::StreamRead { source })?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Take the body out of the response, leaving `Consumed` behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::Consumed)
    }

    /// Convert into an axum response, streaming when the body is a stream.
    pub fn into_http(mut self) -> axum::response::Response {
        use axum::body::Body as AxumBody;

        let status = self.status;
        let mut builder = http::Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers.clone();
            if let Some(len) = self.content_length {
                if !headers.contains_key(CONTENT_LENGTH) {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                }
            }
        }
        let body = match self.take_body() {
            Body::Buffer(bytes) => AxumBody::from(bytes),
            Body::Stream(reader) => {
                AxumBody::from_stream(tokio_util::io::ReaderStream::new(reader))
            }
            Body::Consumed | Body::Empty => match &self.error {
                Some(message) if !status.is_success() => AxumBody::from(message.clone()),
                _ => AxumBody::empty(),
            },
        };
        builder
            .body(body)
            .unwrap_or_else(|_| http::Response::new(AxumBody::empty()))
    }
}
