//! The caller side of an intercepted exchange

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::TransportError;
use crate::network::{
    CacheStoragePolicy, RedirectDecision, RedirectTarget, ResponseDisposition, ResponseHead,
    TransportEvent,
};

/// Receiver of everything an interceptor relays.
///
/// Calls arrive one at a time, in network order, from the exchange's driver.
/// [`did_finish`](Self::did_finish) or [`did_fail`](Self::did_fail) is the
/// last call.
#[async_trait]
pub trait ExchangeClient: Send {
    /// Response head arrived
    async fn did_receive_response(
        &mut self,
        head: &ResponseHead,
        policy: CacheStoragePolicy,
    ) -> ResponseDisposition;

    /// A chunk of response body arrived
    async fn did_load(&mut self, chunk: Bytes);

    /// The server redirected; answer through `reply` (dropping it means stop)
    async fn was_redirected(
        &mut self,
        response: &ResponseHead,
        target: &RedirectTarget,
        reply: oneshot::Sender<RedirectDecision>,
    );

    /// The exchange completed
    async fn did_finish(&mut self);

    /// The exchange failed
    async fn did_fail(&mut self, error: &TransportError);

    /// Whether the caller went away; the driver stops relaying once it has
    fn is_closed(&self) -> bool {
        false
    }
}

/// Client that turns relayed callbacks back into [`TransportEvent`]s, so an
/// intercepted exchange looks like any other forwarding call to its caller.
#[derive(Debug)]
pub struct EventRelay {
    events: mpsc::Sender<TransportEvent>,
    closed: bool,
}

impl EventRelay {
    /// Relay into `events`
    #[must_use]
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events,
            closed: false,
        }
    }

    async fn send(&mut self, event: TransportEvent) {
        if self.closed {
            return;
        }
        if self.events.send(event).await.is_err() {
            debug!("Caller dropped the exchange");
            self.closed = true;
        }
    }
}

#[async_trait]
impl ExchangeClient for EventRelay {
    async fn did_receive_response(
        &mut self,
        head: &ResponseHead,
        policy: CacheStoragePolicy,
    ) -> ResponseDisposition {
        debug!("Relaying {} from {} ({:?})", head.status, head.url, policy);

        let (reply, disposition) = oneshot::channel();
        self.send(TransportEvent::Response {
            head: head.clone(),
            policy,
            reply,
        })
        .await;
        if self.closed {
            return ResponseDisposition::Cancel;
        }
        disposition.await.unwrap_or(ResponseDisposition::Allow)
    }

    async fn did_load(&mut self, chunk: Bytes) {
        self.send(TransportEvent::Data(chunk)).await;
    }

    async fn was_redirected(
        &mut self,
        response: &ResponseHead,
        target: &RedirectTarget,
        reply: oneshot::Sender<RedirectDecision>,
    ) {
        self.send(TransportEvent::Redirect {
            response: response.clone(),
            target: target.clone(),
            reply,
        })
        .await;
    }

    async fn did_finish(&mut self) {
        self.send(TransportEvent::Complete(Ok(()))).await;
        self.closed = true;
    }

    async fn did_fail(&mut self, error: &TransportError) {
        self.send(TransportEvent::Complete(Err(error.clone()))).await;
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{Response, StatusCode};

    fn head() -> ResponseHead {
        let response = Response::builder().status(StatusCode::OK).body(()).unwrap();
        ResponseHead::new(&response, "http://example.com/".parse().unwrap())
    }

    #[tokio::test]
    async fn test_relay_forwards_events_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut relay = EventRelay::new(tx);

        let answer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                match event {
                    TransportEvent::Response {
                        head,
                        policy,
                        reply,
                    } => {
                        seen.push(format!("response {} {policy:?}", head.status.as_u16()));
                        reply.send(ResponseDisposition::Allow).unwrap();
                    }
                    TransportEvent::Data(chunk) => seen.push(format!("data {}", chunk.len())),
                    TransportEvent::Complete(result) => seen.push(format!("complete {}", result.is_ok())),
                    other => panic!("unexpected event: {other:?}"),
                }
            }
            seen
        });

        let disposition = relay
            .did_receive_response(&head(), CacheStoragePolicy::NotAllowed)
            .await;
        assert_eq!(disposition, ResponseDisposition::Allow);
        relay.did_load(Bytes::from_static(b"abc")).await;
        relay.did_finish().await;
        assert!(relay.is_closed());
        drop(relay);

        assert_eq!(
            answer.await.unwrap(),
            vec!["response 200 NotAllowed", "data 3", "complete true"]
        );
    }

    #[tokio::test]
    async fn test_relay_notices_dropped_caller() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let mut relay = EventRelay::new(tx);

        relay.did_load(Bytes::from_static(b"x")).await;
        assert!(relay.is_closed());
        assert_eq!(
            relay
                .did_receive_response(&head(), CacheStoragePolicy::Allowed)
                .await,
            ResponseDisposition::Cancel
        );
    }

    #[tokio::test]
    async fn test_nothing_relayed_after_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut relay = EventRelay::new(tx);

        relay.did_fail(&TransportError::Cancelled).await;
        relay.did_load(Bytes::from_static(b"late")).await;
        drop(relay);

        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Complete(Err(TransportError::Cancelled)))
        ));
        assert!(rx.recv().await.is_none());
    }
}
