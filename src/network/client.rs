//! Hyper-backed transport that forwards requests to the real network

use std::error::Error as StdError;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{
    HeaderMap, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST,
    LOCATION, PROXY_AUTHORIZATION, TRANSFER_ENCODING,
};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;

use crate::config::TransportConfig;
use crate::error::TransportError;

use super::body::{RequestBody, StreamBody};
use super::policy::CacheStoragePolicy;
use super::transport::{
    CallHandle, ForwardCall, RedirectDecision, RedirectTarget, ResponseDisposition, ResponseHead,
    Transport, TransportEvent,
};
use super::{DEFAULT_EVENT_BUFFER, DEFAULT_MAX_REDIRECTS};

type HttpClient = Client<HttpConnector, StreamBody>;

/// Transport that sends requests with the hyper-util pooled client
#[derive(Clone)]
pub struct HyperTransport {
    client: HttpClient,
    max_redirects: usize,
    event_buffer: usize,
}

impl HyperTransport {
    /// Create a transport with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&TransportConfig::default())
    }

    /// Create a transport from configuration
    #[must_use]
    pub fn with_config(config: &TransportConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(config.http2_only)
            .build_http();

        Self {
            client,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Limit the number of redirects followed per call
    #[must_use]
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Capacity of each call's event queue
    #[must_use]
    pub fn event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HyperTransport {
    fn open(&self, request: Request<RequestBody>) -> ForwardCall {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let client = self.client.clone();
        let max_redirects = self.max_redirects;

        let task = tokio::spawn(async move {
            let result = run_call(&client, request, &tx, max_redirects).await;
            if let Err(ref e) = result {
                debug!("Forwarding call ended with error: {e}");
            }
            // Receiver may already be gone
            let _ = tx.send(TransportEvent::Complete(result)).await;
        });

        let handle = CallHandle::new();
        handle.attach(task.abort_handle());
        ForwardCall::new(rx, handle)
    }
}

/// Drive one call: send, handle redirects, stream the body
async fn run_call(
    client: &HttpClient,
    request: Request<RequestBody>,
    events: &mpsc::Sender<TransportEvent>,
    max_redirects: usize,
) -> Result<(), TransportError> {
    let (parts, body) = request.into_parts();
    if parts.uri.scheme().is_none() || parts.uri.authority().is_none() {
        return Err(TransportError::InvalidRequest(format!(
            "request target is not an absolute URL: {}",
            parts.uri
        )));
    }

    let policy = CacheStoragePolicy::for_request(&parts.headers);
    let mut replay = body.replayable();
    let mut method = parts.method.clone();
    let mut uri = parts.uri.clone();
    let mut headers = parts.headers.clone();
    let mut outgoing = Request::from_parts(parts, body.into_stream_body());
    let mut redirects = 0;

    loop {
        debug!("Forwarding {} to {}", method, uri);

        let response = client.request(outgoing).await.map_err(|e| {
            warn!("Request to {uri} failed: {e}");
            classify(&e)
        })?;
        let head = ResponseHead::new(&response, uri.clone());

        if let Some((target, next_body)) =
            redirect_target(&method, &uri, &headers, &response, replay.as_ref())
        {
            let (reply, decision) = oneshot::channel();
            deliver(
                events,
                TransportEvent::Redirect {
                    response: head.clone(),
                    target: target.clone(),
                    reply,
                },
            )
            .await?;

            if decision.await.unwrap_or(RedirectDecision::Stop) == RedirectDecision::Follow {
                if redirects >= max_redirects {
                    return Err(TransportError::TooManyRedirects(max_redirects));
                }
                redirects += 1;
                debug!("Following redirect {} to {}", redirects, target.uri);

                method = target.method;
                uri = target.uri;
                headers = target.headers;
                replay = Some(next_body.clone());

                let mut next = Request::new(RequestBody::Full(next_body).into_stream_body());
                *next.method_mut() = method.clone();
                *next.uri_mut() = uri.clone();
                *next.headers_mut() = headers.clone();
                outgoing = next;
                continue;
            }
        }

        let (reply, disposition) = oneshot::channel();
        deliver(
            events,
            TransportEvent::Response {
                head,
                policy,
                reply,
            },
        )
        .await?;
        if disposition.await.unwrap_or(ResponseDisposition::Allow) == ResponseDisposition::Cancel {
            return Err(TransportError::Cancelled);
        }

        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| TransportError::Body(error_chain(&e)))?;
            if let Ok(data) = frame.into_data() {
                if !data.is_empty() {
                    deliver(events, TransportEvent::Data(data)).await?;
                }
            }
        }

        return Ok(());
    }
}

async fn deliver(
    events: &mpsc::Sender<TransportEvent>,
    event: TransportEvent,
) -> Result<(), TransportError> {
    events
        .send(event)
        .await
        .map_err(|_| TransportError::Cancelled)
}

/// Work out the follow-up request for a redirect response.
///
/// Returns `None` when the response is not a followable redirect, including
/// 307/308 responses to requests whose body cannot be sent twice.
fn redirect_target<B>(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    response: &Response<B>,
    replay: Option<&Bytes>,
) -> Option<(RedirectTarget, Bytes)> {
    let status = response.status();
    let switch_to_get = match status {
        StatusCode::SEE_OTHER => *method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => *method == Method::POST,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => false,
        _ => return None,
    };

    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    let base = Url::parse(&uri.to_string()).ok()?;
    let next = base.join(location).ok()?;
    let next_uri: Uri = next.as_str().parse().ok()?;

    let mut next_headers = headers.clone();
    next_headers.remove(HOST);
    if next.origin() != base.origin() {
        next_headers.remove(AUTHORIZATION);
        next_headers.remove(PROXY_AUTHORIZATION);
        next_headers.remove(COOKIE);
    }

    let (next_method, body) = if switch_to_get {
        for name in [CONTENT_LENGTH, CONTENT_TYPE, CONTENT_ENCODING, TRANSFER_ENCODING] {
            next_headers.remove(name);
        }
        (Method::GET, Bytes::new())
    } else {
        (method.clone(), replay?.clone())
    };

    Some((
        RedirectTarget {
            method: next_method,
            uri: next_uri,
            headers: next_headers,
        },
        body,
    ))
}

fn classify(error: &hyper_util::client::legacy::Error) -> TransportError {
    let description = error_chain(error);
    if error.is_connect() {
        TransportError::Connect(description)
    } else {
        TransportError::Protocol(description)
    }
}

/// Flatten an error and its sources into one line
fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut description = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        description.push_str(": ");
        description.push_str(&cause.to_string());
        source = cause.source();
    }
    description
}
