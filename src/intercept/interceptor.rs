//! Per-exchange interceptor
//!
//! An [`Interceptor`] owns one forwarding call and one [`RequestRecord`].
//! A driver task consumes the call's events in order, relays each to the
//! caller and then records it. [`Interceptor::stop`] tears the exchange
//! down and writes the final record.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use hyper::Request;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::TransportError;
use crate::network::{
    CacheStoragePolicy, CallHandle, Challenge, ChallengeDisposition, Intercepted, RequestBody,
    StreamCapture, Transport, TransportEvent,
};
use crate::recording::{RecordStore, RequestRecord};
use crate::{Result, TapwireError};

use super::client::ExchangeClient;
use super::SETTLE_TIMEOUT_MS;

/// Lifecycle phase of an exchange. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Built, nothing sent yet
    Created,
    /// Forwarding call open, waiting for a response head
    Sending,
    /// Response head received, body streaming
    Receiving,
    /// Terminal
    Finalized,
}

impl Phase {
    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns error if `next` would re-enter or go back to an earlier phase
    pub fn advance(&mut self, next: Self) -> Result<()> {
        if next > *self {
            *self = next;
            Ok(())
        } else {
            Err(TapwireError::InvalidTransition(format!(
                "{self:?} -> {next:?}"
            )))
        }
    }
}

/// State shared between the driver and teardown
struct Exchange {
    phase: Phase,
    torn_down: bool,
    record: RequestRecord,
}

type SharedExchange = Arc<Mutex<Exchange>>;

fn lock(exchange: &SharedExchange) -> MutexGuard<'_, Exchange> {
    exchange.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply `apply` unless the exchange was torn down. Errors are logged.
fn update<F>(exchange: &SharedExchange, apply: F)
where
    F: FnOnce(&mut Exchange) -> Result<()>,
{
    let mut exchange = lock(exchange);
    if exchange.torn_down {
        debug!("Exchange {} torn down, dropping update", exchange.record.id());
        return;
    }
    if let Err(e) = apply(&mut *exchange) {
        error!("Exchange {}: {e}", exchange.record.id());
    }
}

fn save(store: &dyn RecordStore, record: &RequestRecord) {
    if let Err(e) = store.save_request(record) {
        warn!("Failed to save record {}: {e}", record.id());
    }
}

/// Mediator for one in-flight exchange
pub struct Interceptor {
    exchange: SharedExchange,
    call: CallHandle,
    capture: Option<Arc<StreamCapture>>,
    store: Arc<dyn RecordStore>,
    started: Instant,
    driver: Option<JoinHandle<()>>,
}

impl Interceptor {
    /// Start intercepting `request`.
    ///
    /// The record is built from the request as given and saved right away.
    /// The copy sent through `transport` carries the [`Intercepted`] marker.
    /// Must be called from within a tokio runtime.
    pub fn start(
        request: Request<RequestBody>,
        transport: &dyn Transport,
        store: Arc<dyn RecordStore>,
        client: Box<dyn ExchangeClient>,
    ) -> Self {
        let started = Instant::now();
        let (mut parts, body) = request.into_parts();

        let (forward_body, capture, record) = match body {
            RequestBody::Empty => (RequestBody::Empty, None, RequestRecord::new(&parts, None)),
            RequestBody::Full(bytes) => {
                let record = RequestRecord::new(&parts, Some(&bytes));
                (RequestBody::Full(bytes), None, record)
            }
            RequestBody::Stream(stream) => {
                let (capture, tee) = StreamCapture::tee(stream);
                let record = RequestRecord::new(&parts, None);
                (RequestBody::stream(tee), Some(capture), record)
            }
        };
        let policy = CacheStoragePolicy::for_request(&parts.headers);

        debug!("Intercepting {} {} as {}", record.method(), record.url(), record.id());
        save(store.as_ref(), &record);

        let mut phase = Phase::Created;
        if let Err(e) = phase.advance(Phase::Sending) {
            error!("Exchange {}: {e}", record.id());
        }
        let exchange = Arc::new(Mutex::new(Exchange {
            phase,
            torn_down: false,
            record,
        }));

        parts.extensions.insert(Intercepted);
        let (events, call) = transport
            .open(Request::from_parts(parts, forward_body))
            .into_parts();

        let driver = tokio::spawn(drive(Arc::clone(&exchange), events, client, policy));

        Self {
            exchange,
            call,
            capture,
            store,
            started,
            driver: Some(driver),
        }
    }

    /// Record id of this exchange
    #[must_use]
    pub fn id(&self) -> String {
        lock(&self.exchange).record.id().to_string()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        lock(&self.exchange).phase
    }

    /// Copy of the current record
    #[must_use]
    pub fn record(&self) -> RequestRecord {
        lock(&self.exchange).record.clone()
    }

    /// Wait until the driver has relayed the last event.
    ///
    /// Cancel safe: dropping the future keeps the driver attached.
    pub async fn wait(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            if let Err(e) = driver.await {
                if !e.is_cancelled() {
                    error!("Exchange driver failed: {e}");
                }
            }
            self.driver = None;
        }
    }

    /// Tear the exchange down and write the final record.
    ///
    /// Cancels the forwarding call and lets the driver finish the event in
    /// hand, aborting it after [`SETTLE_TIMEOUT_MS`]. Then snapshots the
    /// request body (draining a streamed body), fails a still-pending
    /// outcome as cancelled, sets the duration and saves. Calling it again
    /// does nothing.
    pub async fn stop(&mut self) {
        if lock(&self.exchange).torn_down {
            return;
        }

        self.call.cancel();
        self.settle().await;
        lock(&self.exchange).torn_down = true;

        let request_body = match &self.capture {
            Some(capture) => Some(capture.drain().await.to_vec()),
            None => None,
        };

        let record = {
            let mut exchange = lock(&self.exchange);
            let Exchange { phase, record, .. } = &mut *exchange;

            if record.outcome().is_pending() {
                if let Err(e) = record.mark_failed(TransportError::Cancelled.to_string()) {
                    error!("Exchange {}: {e}", record.id());
                }
            }
            if let Err(e) = record.finalize(request_body, self.started.elapsed()) {
                error!("Exchange {}: {e}", record.id());
            }
            if *phase < Phase::Finalized {
                *phase = Phase::Finalized;
            }

            debug!("Exchange {} finished: {}", record.id(), record.outcome());
            record.clone()
        };

        save(self.store.as_ref(), &record);
    }

    async fn settle(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            let settled =
                tokio::time::timeout(Duration::from_millis(SETTLE_TIMEOUT_MS), &mut *driver).await;
            if settled.is_err() {
                debug!("Exchange driver still busy after cancel, aborting");
                driver.abort();
            }
            self.driver = None;
        }
    }
}

/// Consume the forwarding call's events: relay first, then record
async fn drive(
    exchange: SharedExchange,
    mut events: mpsc::Receiver<TransportEvent>,
    mut client: Box<dyn ExchangeClient>,
    policy: CacheStoragePolicy,
) {
    let mut terminated = false;

    while let Some(event) = events.recv().await {
        if lock(&exchange).torn_down {
            debug!("Dropping event after teardown");
            break;
        }

        match event {
            TransportEvent::Response { head, reply, .. } => {
                let disposition = client.did_receive_response(&head, policy).await;
                update(&exchange, |exchange| {
                    exchange.phase.advance(Phase::Receiving)?;
                    exchange.record.set_response(head.snapshot())
                });
                let _ = reply.send(disposition);
            }
            TransportEvent::Data(chunk) => {
                client.did_load(chunk.clone()).await;
                update(&exchange, |exchange| {
                    if exchange.phase != Phase::Receiving {
                        return Err(TapwireError::InvalidTransition(format!(
                            "body data in phase {:?}",
                            exchange.phase
                        )));
                    }
                    exchange.record.append_body(&chunk)
                });
            }
            TransportEvent::Redirect {
                response,
                target,
                reply,
            } => {
                debug!("Redirect {} -> {}", response.url, target.uri);
                client.was_redirected(&response, &target, reply).await;
            }
            TransportEvent::Challenge { challenge, reply } => match challenge {
                Challenge::ServerTrust {
                    verdict: Some(verdict),
                    ..
                } => {
                    let _ = reply.send(ChallengeDisposition::UseTrust(verdict));
                }
                other => debug!("Leaving challenge to default handling: {other:?}"),
            },
            TransportEvent::Complete(Ok(())) => {
                client.did_finish().await;
                update(&exchange, |exchange| {
                    exchange.phase.advance(Phase::Finalized)?;
                    exchange.record.mark_succeeded()
                });
                terminated = true;
                break;
            }
            TransportEvent::Complete(Err(error)) | TransportEvent::Invalidated(error) => {
                client.did_fail(&error).await;
                update(&exchange, |exchange| {
                    exchange.phase.advance(Phase::Finalized)?;
                    exchange.record.mark_failed(error.to_string())
                });
                terminated = true;
                break;
            }
        }

        if client.is_closed() {
            debug!("Caller closed, stopping relay");
            return;
        }
    }

    if !terminated && !client.is_closed() && !lock(&exchange).torn_down {
        // Transport went away without a completion event
        client.did_fail(&TransportError::Cancelled).await;
    }
}
