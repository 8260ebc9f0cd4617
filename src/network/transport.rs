//! Forwarding calls and the events they deliver
//!
//! A [`Transport`] turns a request into a [`ForwardCall`]: an ordered queue
//! of [`TransportEvent`]s plus a [`CallHandle`] for cancellation. Each call
//! has exactly one consumer, which is what serializes the callbacks of an
//! exchange.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::AbortHandle;

use crate::error::{BoxError, TransportError};
use crate::recording::ResponseSnapshot;

use super::body::RequestBody;
use super::policy::CacheStoragePolicy;

/// Marker carried by requests that an interceptor already claimed.
///
/// Only the forwarded copy is marked; the caller's request is untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intercepted;

/// Whether `request` was issued by an interceptor
pub fn is_intercepted<B>(request: &Request<B>) -> bool {
    request.extensions().get::<Intercepted>().is_some()
}

/// Something that can send a request to the network
pub trait Transport: Send + Sync {
    /// Start a forwarding call. Must be called from within a tokio runtime.
    fn open(&self, request: Request<RequestBody>) -> ForwardCall;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn open(&self, request: Request<RequestBody>) -> ForwardCall {
        (**self).open(request)
    }
}

/// Response metadata as received from the network
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Status code
    pub status: StatusCode,
    /// HTTP version the response arrived with
    pub version: Version,
    /// Response headers, byte-exact
    pub headers: HeaderMap,
    /// URL the response was fetched from
    pub url: Uri,
}

impl ResponseHead {
    /// Capture the head of a response
    pub fn new<B>(response: &Response<B>, url: Uri) -> Self {
        Self {
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
            url,
        }
    }

    /// Record form of this head
    #[must_use]
    pub fn snapshot(&self) -> ResponseSnapshot {
        ResponseSnapshot::new(self.status, &self.headers)
    }
}

/// Request the transport would issue when following a redirect
#[derive(Debug, Clone)]
pub struct RedirectTarget {
    /// Method of the follow-up request
    pub method: Method,
    /// Resolved target URL
    pub uri: Uri,
    /// Headers of the follow-up request
    pub headers: HeaderMap,
}

/// Caller's answer to a response head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Keep receiving the body
    Allow,
    /// Stop the call
    Cancel,
}

/// Caller's answer to a redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectDecision {
    /// Issue the follow-up request
    Follow,
    /// Deliver the redirect response as the final response
    Stop,
}

/// Trust evaluation already performed by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustVerdict {
    /// Host the credential was presented for
    pub host: String,
    /// Result of the transport's own evaluation
    pub trusted: bool,
}

/// Authentication challenge raised during a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Server presented an identity to validate
    ServerTrust {
        /// Server host
        host: String,
        /// Verdict, when the transport computed one
        verdict: Option<TrustVerdict>,
    },
    /// Any other challenge (basic, digest, client certificate, ...)
    Other {
        /// Server host
        host: String,
        /// Authentication scheme name
        scheme: String,
    },
}

/// Answer to a [`Challenge`].
///
/// A dropped responder means [`PerformDefault`](Self::PerformDefault).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDisposition {
    /// Accept the given verdict and continue
    UseTrust(TrustVerdict),
    /// Let the transport apply its default handling
    PerformDefault,
    /// Cancel the call
    Cancel,
}

/// One step of a forwarding call, in network order
#[derive(Debug)]
pub enum TransportEvent {
    /// Response head arrived; the transport waits for `reply` before reading the body
    Response {
        /// Response metadata
        head: ResponseHead,
        /// How the caller may cache the response, derived from the request
        policy: CacheStoragePolicy,
        /// Whether to keep receiving
        reply: oneshot::Sender<ResponseDisposition>,
    },
    /// A chunk of response body
    Data(Bytes),
    /// Server asked for a redirect; the transport waits for `reply`
    Redirect {
        /// The 3xx response head
        response: ResponseHead,
        /// The request that following would issue
        target: RedirectTarget,
        /// Follow or stop
        reply: oneshot::Sender<RedirectDecision>,
    },
    /// Server raised an authentication challenge
    Challenge {
        /// Challenge details
        challenge: Challenge,
        /// How to proceed
        reply: oneshot::Sender<ChallengeDisposition>,
    },
    /// The forwarding session became unusable
    Invalidated(TransportError),
    /// Call finished; always the last event
    Complete(Result<(), TransportError>),
}

/// Cancellation handle shared between a call and its owners
#[derive(Debug, Clone, Default)]
pub struct CallHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug, Default)]
struct HandleInner {
    cancelled: AtomicBool,
    notify: Notify,
    abort: Mutex<Option<AbortHandle>>,
}

impl CallHandle {
    /// Create a handle not bound to any task
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort `task` when the call is cancelled
    pub fn attach(&self, task: AbortHandle) {
        let mut slot = self
            .inner
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            task.abort();
        } else {
            *slot = Some(task);
        }
    }

    /// Cancel the call. Cancelling a finished call does nothing.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        let task = self
            .inner
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Whether [`cancel`](Self::cancel) was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the call is cancelled
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// An in-flight forwarding call
#[derive(Debug)]
pub struct ForwardCall {
    events: mpsc::Receiver<TransportEvent>,
    handle: CallHandle,
}

impl ForwardCall {
    /// Wrap an event queue and its handle
    #[must_use]
    pub fn new(events: mpsc::Receiver<TransportEvent>, handle: CallHandle) -> Self {
        Self { events, handle }
    }

    /// Next event, or `None` once the producer is gone
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Handle for cancelling this call
    #[must_use]
    pub fn handle(&self) -> CallHandle {
        self.handle.clone()
    }

    /// Cancel the call
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Split into the event queue and the handle
    #[must_use]
    pub fn into_parts(self) -> (mpsc::Receiver<TransportEvent>, CallHandle) {
        (self.events, self.handle)
    }

    /// Wait for the response head and return a response whose body streams
    /// the remaining events.
    ///
    /// Redirects are not followed: the 3xx is returned as the response.
    /// The response's extensions carry the call's [`CacheStoragePolicy`].
    ///
    /// # Errors
    ///
    /// Returns the call's error if it fails before a response head arrives
    pub async fn into_response(mut self) -> Result<Response<CallBody>, TransportError> {
        loop {
            match self.events.recv().await {
                Some(TransportEvent::Response {
                    head,
                    policy,
                    reply,
                }) => {
                    let _ = reply.send(ResponseDisposition::Allow);
                    let mut response = Response::new(CallBody::new(self.events, self.handle));
                    *response.status_mut() = head.status;
                    *response.headers_mut() = head.headers;
                    response.extensions_mut().insert(policy);
                    return Ok(response);
                }
                Some(TransportEvent::Redirect { reply, .. }) => {
                    let _ = reply.send(RedirectDecision::Stop);
                }
                Some(TransportEvent::Challenge { .. } | TransportEvent::Data(_)) => {}
                Some(TransportEvent::Complete(Ok(()))) => {
                    return Err(TransportError::Protocol(
                        "call completed without a response".to_string(),
                    ));
                }
                Some(
                    TransportEvent::Complete(Err(error)) | TransportEvent::Invalidated(error),
                ) => return Err(error),
                None => return Err(TransportError::Cancelled),
            }
        }
    }
}

/// Response body fed by the data events of a call.
///
/// Dropping the body before the call completes cancels the call.
#[derive(Debug)]
pub struct CallBody {
    events: mpsc::Receiver<TransportEvent>,
    handle: CallHandle,
    done: bool,
}

impl CallBody {
    fn new(events: mpsc::Receiver<TransportEvent>, handle: CallHandle) -> Self {
        Self {
            events,
            handle,
            done: false,
        }
    }
}

impl Body for CallBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        while !this.done {
            let Poll::Ready(event) = this.events.poll_recv(cx) else {
                return Poll::Pending;
            };
            match event {
                Some(TransportEvent::Data(chunk)) => return Poll::Ready(Some(Ok(Frame::data(chunk)))),
                Some(TransportEvent::Complete(Ok(()))) => this.done = true,
                Some(
                    TransportEvent::Complete(Err(error)) | TransportEvent::Invalidated(error),
                ) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(error.into())));
                }
                None => {
                    this.done = true;
                    return Poll::Ready(Some(Err(TransportError::Cancelled.into())));
                }
                Some(TransportEvent::Response { reply, .. }) => {
                    let _ = reply.send(ResponseDisposition::Allow);
                }
                Some(TransportEvent::Redirect { reply, .. }) => {
                    let _ = reply.send(RedirectDecision::Stop);
                }
                Some(TransportEvent::Challenge { .. }) => {}
            }
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }
}

impl Drop for CallBody {
    fn drop(&mut self) {
        if !self.done {
            self.handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn head(status: StatusCode) -> ResponseHead {
        let response = Response::builder()
            .status(status)
            .header("content-type", "text/plain")
            .body(())
            .unwrap();
        ResponseHead::new(&response, "http://example.com/".parse().unwrap())
    }

    #[test]
    fn test_intercepted_marker() {
        let mut request = Request::new(());
        assert!(!is_intercepted(&request));
        request.extensions_mut().insert(Intercepted);
        assert!(is_intercepted(&request));
    }

    #[test]
    fn test_response_head_snapshot() {
        let snapshot = head(StatusCode::CREATED).snapshot();
        assert_eq!(snapshot.status, 201);
        assert_eq!(snapshot.mime_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_cancel_aborts_attached_task() {
        let handle = CallHandle::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        handle.attach(task.abort_handle());
        handle.cancel();

        let result = task.await;
        assert!(result.unwrap_err().is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let handle = CallHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already cancelled: returns immediately
        handle.cancelled().await;
    }

    #[tokio::test]
    async fn test_into_response_streams_body() {
        let (tx, rx) = mpsc::channel(8);
        let call = ForwardCall::new(rx, CallHandle::new());

        tokio::spawn(async move {
            let (reply, _) = oneshot::channel();
            tx.send(TransportEvent::Response {
                head: head(StatusCode::OK),
                policy: CacheStoragePolicy::Allowed,
                reply,
            })
            .await
            .unwrap();
            tx.send(TransportEvent::Data(Bytes::from_static(b"hello ")))
                .await
                .unwrap();
            tx.send(TransportEvent::Data(Bytes::from_static(b"world")))
                .await
                .unwrap();
            tx.send(TransportEvent::Complete(Ok(()))).await.unwrap();
        });

        let response = call.into_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/plain");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_into_response_carries_cache_policy() {
        let (tx, rx) = mpsc::channel(8);
        let call = ForwardCall::new(rx, CallHandle::new());
        let (reply, _) = oneshot::channel();
        tx.send(TransportEvent::Response {
            head: head(StatusCode::OK),
            policy: CacheStoragePolicy::AllowedInMemoryOnly,
            reply,
        })
        .await
        .unwrap();

        let response = call.into_response().await.unwrap();
        assert_eq!(
            response.extensions().get::<CacheStoragePolicy>(),
            Some(&CacheStoragePolicy::AllowedInMemoryOnly)
        );
    }

    #[tokio::test]
    async fn test_into_response_stops_redirects() {
        let (tx, rx) = mpsc::channel(8);
        let call = ForwardCall::new(rx, CallHandle::new());

        let producer = tokio::spawn(async move {
            let (reply, decision) = oneshot::channel();
            tx.send(TransportEvent::Redirect {
                response: head(StatusCode::FOUND),
                target: RedirectTarget {
                    method: Method::GET,
                    uri: "http://example.com/next".parse().unwrap(),
                    headers: HeaderMap::new(),
                },
                reply,
            })
            .await
            .unwrap();
            let decision = decision.await.unwrap();

            let (reply, _) = oneshot::channel();
            tx.send(TransportEvent::Response {
                head: head(StatusCode::FOUND),
                policy: CacheStoragePolicy::Allowed,
                reply,
            })
            .await
            .unwrap();
            tx.send(TransportEvent::Complete(Ok(()))).await.unwrap();
            decision
        });

        let response = call.into_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(producer.await.unwrap(), RedirectDecision::Stop);
    }

    #[tokio::test]
    async fn test_into_response_reports_failure() {
        let (tx, rx) = mpsc::channel(8);
        let call = ForwardCall::new(rx, CallHandle::new());
        tx.send(TransportEvent::Complete(Err(TransportError::Connect(
            "refused".to_string(),
        ))))
        .await
        .unwrap();

        let error = call.into_response().await.unwrap_err();
        assert_eq!(error, TransportError::Connect("refused".to_string()));
    }

    #[tokio::test]
    async fn test_body_error_after_partial_data() {
        let (tx, rx) = mpsc::channel(8);
        let call = ForwardCall::new(rx, CallHandle::new());
        let (reply, _) = oneshot::channel();
        tx.send(TransportEvent::Response {
            head: head(StatusCode::OK),
            policy: CacheStoragePolicy::Allowed,
            reply,
        })
        .await
        .unwrap();
        tx.send(TransportEvent::Data(Bytes::from_static(b"part")))
            .await
            .unwrap();
        tx.send(TransportEvent::Complete(Err(TransportError::Body(
            "reset".to_string(),
        ))))
        .await
        .unwrap();

        let mut body = call.into_response().await.unwrap().into_body();
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"part"));
        assert!(body.frame().await.unwrap().is_err());
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_body_cancels_call() {
        let (tx, rx) = mpsc::channel(8);
        let call = ForwardCall::new(rx, CallHandle::new());
        let handle = call.handle();
        let (reply, _) = oneshot::channel();
        tx.send(TransportEvent::Response {
            head: head(StatusCode::OK),
            policy: CacheStoragePolicy::Allowed,
            reply,
        })
        .await
        .unwrap();

        let response = call.into_response().await.unwrap();
        drop(response);
        assert!(handle.is_cancelled());
    }
}
