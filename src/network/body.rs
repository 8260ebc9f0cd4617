//! Request bodies and one-shot capture of streamed bodies

use std::fmt;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use tracing::warn;

use crate::error::BoxError;

use super::DRAIN_TIMEOUT_MS;

/// Type-erased streaming body
pub type StreamBody = UnsyncBoxBody<Bytes, BoxError>;

/// Body of a request handed to a transport
pub enum RequestBody {
    /// No body
    Empty,
    /// In-memory body; can be sent again on redirect
    Full(Bytes),
    /// Streamed body; can be read exactly once
    Stream(StreamBody),
}

impl RequestBody {
    /// Wrap any body as a stream
    pub fn stream<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self::Stream(body.map_err(Into::into).boxed_unsync())
    }

    /// The bytes, when the body can be replayed
    #[must_use]
    pub fn replayable(&self) -> Option<Bytes> {
        match self {
            Self::Empty => Some(Bytes::new()),
            Self::Full(bytes) => Some(bytes.clone()),
            Self::Stream(_) => None,
        }
    }

    /// Convert into a body a hyper client can send
    #[must_use]
    pub fn into_stream_body(self) -> StreamBody {
        match self {
            Self::Empty => Empty::new().map_err(|never| match never {}).boxed_unsync(),
            Self::Full(bytes) => Full::new(bytes).map_err(|never| match never {}).boxed_unsync(),
            Self::Stream(body) => body,
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::Empty
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Full(Bytes::from(bytes))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Full(Bytes::from_static(text.as_bytes()))
    }
}

/// Shared state of a streamed body that is being forwarded and captured.
///
/// The inner stream is read once. Whatever reads it (the forwarding call
/// through [`TeeBody`], or [`drain`](Self::drain) at teardown) appends the
/// data frames to the same buffer, in order.
pub struct StreamCapture {
    state: Mutex<CaptureState>,
}

struct CaptureState {
    body: Option<StreamBody>,
    captured: BytesMut,
    detached: bool,
}

impl StreamCapture {
    /// Take ownership of `body`; returns the capture and the body to forward
    #[must_use]
    pub fn tee(body: StreamBody) -> (Arc<Self>, TeeBody) {
        let capture = Arc::new(Self {
            state: Mutex::new(CaptureState {
                body: Some(body),
                captured: BytesMut::new(),
                detached: false,
            }),
        });
        let tee = TeeBody {
            capture: Arc::clone(&capture),
        };
        (capture, tee)
    }

    /// Bytes captured so far
    #[must_use]
    pub fn captured(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock().captured)
    }

    /// Detach the stream from the forwarding side and read it to the end.
    ///
    /// This is destructive: the forwarded copy sees an error from here on.
    /// Read errors and the drain timeout keep whatever was captured.
    pub async fn drain(&self) -> Bytes {
        self.lock().detached = true;

        let drained = tokio::time::timeout(
            Duration::from_millis(DRAIN_TIMEOUT_MS),
            poll_fn(|cx| self.poll_drain(cx)),
        )
        .await;
        if drained.is_err() {
            warn!("Request body drain timed out, keeping partial snapshot");
        }
        self.captured()
    }

    fn poll_drain(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        loop {
            let Some(body) = state.body.as_mut() else {
                return Poll::Ready(());
            };
            match Pin::new(body).poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(frame))) => {
                    if let Some(data) = frame.data_ref() {
                        state.captured.extend_from_slice(data);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    warn!("Request body read failed during drain: {e}");
                    state.body = None;
                }
                Poll::Ready(None) => state.body = None,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for StreamCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("StreamCapture")
            .field("captured", &state.captured.len())
            .field("finished", &state.body.is_none())
            .field("detached", &state.detached)
            .finish()
    }
}

/// Forwarded side of a [`StreamCapture`]
pub struct TeeBody {
    capture: Arc<StreamCapture>,
}

impl Body for TeeBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let mut guard = self.capture.lock();
        let state = &mut *guard;
        if state.detached {
            return Poll::Ready(Some(Err("request body detached by teardown".into())));
        }
        let Some(body) = state.body.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(body).poll_frame(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    state.captured.extend_from_slice(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                state.body = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                state.body = None;
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        let state = self.capture.lock();
        !state.detached && state.body.as_ref().map_or(true, Body::is_end_stream)
    }

    fn size_hint(&self) -> SizeHint {
        self.capture
            .lock()
            .body
            .as_ref()
            .map_or_else(|| SizeHint::with_exact(0), Body::size_hint)
    }
}
