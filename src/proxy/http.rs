//! HTTP forward-proxy request handling

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use tracing::{debug, warn};

use crate::error::BoxError;
use crate::network::{RequestBody, Transport};

/// Body of responses sent back to proxy clients
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Request headers that only concern the client-to-proxy hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward proxy that sends every request through a [`Transport`]
#[derive(Clone)]
pub struct HttpProxy {
    transport: Arc<dyn Transport>,
}

impl HttpProxy {
    /// Create a proxy in front of `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Handle one proxied request. Failures become error responses.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if request.method() == Method::CONNECT {
            warn!("Refusing CONNECT to {}", request.uri());
            return create_response(
                StatusCode::NOT_IMPLEMENTED,
                "CONNECT tunnelling is not supported",
            );
        }

        let (mut parts, body) = request.into_parts();
        parts.uri = match absolute_uri(&parts.uri, parts.headers.get(HOST)) {
            Some(uri) => uri,
            None => {
                return create_response(StatusCode::BAD_REQUEST, "Request target has no host");
            }
        };
        for name in HOP_BY_HOP {
            parts.headers.remove(*name);
        }

        let body = if body.is_end_stream() {
            RequestBody::Empty
        } else {
            RequestBody::stream(body)
        };

        debug!("Proxying {} {}", parts.method, parts.uri);
        match self
            .transport
            .open(Request::from_parts(parts, body))
            .into_response()
            .await
        {
            Ok(response) => response.map(BodyExt::boxed_unsync),
            Err(e) => {
                warn!("Upstream request failed: {e}");
                create_response(StatusCode::BAD_GATEWAY, e.to_string())
            }
        }
    }
}

/// Resolve the request target to an absolute URI, using `Host` for
/// origin-form targets
fn absolute_uri(uri: &Uri, host: Option<&HeaderValue>) -> Option<Uri> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Some(uri.clone());
    }

    let host = host?.to_str().ok()?;
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    format!("http://{host}{path}").parse().ok()
}

/// Create a plain-text response
fn create_response(status: StatusCode, message: impl Into<Bytes>) -> Response<ProxyBody> {
    let body = Full::new(message.into())
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
