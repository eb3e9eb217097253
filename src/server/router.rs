//! Axum router configuration
//!
//! The gateway serves arbitrary object paths, so instead of a route table
//! there is a single catch-all handler that translates each request into
//! a [`DerivedObject`] and hands it to the dispatcher.

use std::sync::Arc;

use axum::Router;
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::response::IntoResponse;
use bytes::Bytes;
use http::{Method, StatusCode};
use tracing::debug;

use crate::config::AppConfig;
use crate::object::{ParseError, parse_request};
use crate::processor::{Dispatcher, RequestMeta};
use crate::response::Response;

/// Largest accepted PUT body.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Shared state behind every route.
#[derive(Clone)]
#[allow(missing_docs)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the router: one catch-all object handler.
pub fn build_router(state: AppState) -> Router {
    Router::new().fallback(handle_object).with_state(state)
}

/// Translate an HTTP request into a coordinator invocation.
async fn handle_object(State(state): State<AppState>, req: Request) -> axum::response::Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let raw_query = req.uri().query().unwrap_or_default().to_string();
    let headers = req.headers().clone();

    let obj = match parse_request(&state.config, &path, &raw_query) {
        Ok(obj) => obj,
        Err(e @ ParseError::UnknownBucket { .. }) => {
            debug!(path = %path, "rejecting request: {e}");
            return Response::error(StatusCode::NOT_FOUND, e.to_string()).into_http();
        }
        Err(e) => {
            debug!(path = %path, "rejecting request: {e}");
            return Response::error(StatusCode::BAD_REQUEST, e.to_string()).into_http();
        }
    };

    let body = if method == Method::PUT {
        match to_bytes(req.into_body(), MAX_UPLOAD_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Response::error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("failed to read request body: {e}"),
                )
                .into_http();
            }
        }
    } else {
        Bytes::new()
    };

    let meta = RequestMeta {
        method: method.clone(),
        headers,
        query: url::form_urlencoded::parse(raw_query.as_bytes())
            .map(|(n, v)| (n.into_owned(), v.into_owned()))
            .collect(),
        body,
    };

    let res = state.dispatcher.dispatch(meta, obj).await;

    let mut http_res = res.into_http();
    if method == Method::HEAD {
        // Headers stay, the body goes.
        *http_res.body_mut() = axum::body::Body::empty();
    }
    http_res.into_response()
}
