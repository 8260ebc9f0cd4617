//! Dispatch path: decides per request whether to intercept

use std::sync::Arc;

use hyper::Request;
use tokio::sync::mpsc;
use tracing::debug;

use crate::network::{
    is_intercepted, CallHandle, ForwardCall, RequestBody, Transport, DEFAULT_EVENT_BUFFER,
};
use crate::recording::RecordStore;
use crate::registry::InterceptorRegistry;

use super::client::EventRelay;
use super::interceptor::Interceptor;

/// Transport that records filtered traffic on its way to the network.
///
/// Requests that pass the registry's filter are run through an
/// [`Interceptor`]; its forwarding call comes back through this dispatcher
/// marked as intercepted and goes straight to the network transport.
#[derive(Clone)]
pub struct Dispatcher {
    network: Arc<dyn Transport>,
    registry: Arc<InterceptorRegistry>,
    store: Arc<dyn RecordStore>,
    event_buffer: usize,
}

impl Dispatcher {
    /// Create a dispatcher in front of `network`
    #[must_use]
    pub fn new(
        network: Arc<dyn Transport>,
        registry: Arc<InterceptorRegistry>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            network,
            registry,
            store,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Capacity of the event queue handed to callers
    #[must_use]
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    /// Registry consulted for every request
    #[must_use]
    pub fn registry(&self) -> &Arc<InterceptorRegistry> {
        &self.registry
    }

    /// Whether `request` would be intercepted
    pub fn can_intercept<B>(&self, request: &Request<B>) -> bool {
        !is_intercepted(request) && self.registry.filter().should_intercept_uri(request.uri())
    }

    /// Run `request` through an interceptor.
    ///
    /// The exchange is torn down when the call completes, when the caller
    /// cancels the returned call, or when the caller drops it.
    pub fn intercept(&self, request: Request<RequestBody>) -> ForwardCall {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let handle = CallHandle::new();
        let caller = tx.clone();

        let mut interceptor = Interceptor::start(
            request,
            self,
            Arc::clone(&self.store),
            Box::new(EventRelay::new(tx)),
        );

        let cancelled = handle.clone();
        tokio::spawn(async move {
            let id = interceptor.id();
            tokio::select! {
                () = interceptor.wait() => {}
                () = cancelled.cancelled() => debug!("Exchange {id} cancelled by caller"),
                () = caller.closed() => debug!("Exchange {id} dropped by caller"),
            }
            drop(caller);
            interceptor.stop().await;
        });

        ForwardCall::new(rx, handle)
    }
}

impl Transport for Dispatcher {
    fn open(&self, request: Request<RequestBody>) -> ForwardCall {
        if self.can_intercept(&request) {
            self.intercept(request)
        } else {
            debug!("Passing through {} {}", request.method(), request.uri());
            self.network.open(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{CacheStoragePolicy, Intercepted, ResponseHead, TransportEvent};
    use crate::recording::{MemoryStore, RequestRecord};
    use hyper::{Response, StatusCode};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Transport that counts calls and never answers
    #[derive(Default)]
    struct CountingTransport {
        opened: Mutex<Vec<bool>>,
    }

    impl Transport for CountingTransport {
        fn open(&self, request: Request<RequestBody>) -> ForwardCall {
            self.opened.lock().unwrap().push(is_intercepted(&request));
            let (_tx, rx) = mpsc::channel(1);
            ForwardCall::new(rx, CallHandle::new())
        }
    }

    /// Transport whose calls stay open until cancelled
    #[derive(Default)]
    struct HangingTransport {
        handles: Mutex<Vec<CallHandle>>,
    }

    impl Transport for HangingTransport {
        fn open(&self, _request: Request<RequestBody>) -> ForwardCall {
            let (tx, rx) = mpsc::channel(1);
            let task = tokio::spawn(async move {
                let _events = tx;
                std::future::pending::<()>().await;
            });
            let handle = CallHandle::new();
            handle.attach(task.abort_handle());
            self.handles.lock().unwrap().push(handle.clone());
            ForwardCall::new(rx, handle)
        }
    }

    /// Transport that answers every call with an empty 200
    struct OkTransport;

    impl Transport for OkTransport {
        fn open(&self, request: Request<RequestBody>) -> ForwardCall {
            let (tx, rx) = mpsc::channel(4);
            let uri = request.uri().clone();
            tokio::spawn(async move {
                let response = Response::builder().status(StatusCode::OK).body(()).unwrap();
                let (reply, _) = oneshot::channel();
                let _ = tx
                    .send(TransportEvent::Response {
                        head: ResponseHead::new(&response, uri),
                        policy: CacheStoragePolicy::Allowed,
                        reply,
                    })
                    .await;
                let _ = tx.send(TransportEvent::Complete(Ok(()))).await;
            });
            ForwardCall::new(rx, CallHandle::new())
        }
    }

    fn with_network(network: Arc<dyn Transport>) -> (Dispatcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            network,
            Arc::new(InterceptorRegistry::new()),
            Arc::clone(&store) as Arc<dyn RecordStore>,
        );
        (dispatcher, store)
    }

    async fn finalized(store: &MemoryStore) -> RequestRecord {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(record) = store.records().into_iter().find(RequestRecord::is_finalized) {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    fn dispatcher(blacklist: &[&str]) -> (Dispatcher, Arc<CountingTransport>, Arc<MemoryStore>) {
        let network = Arc::new(CountingTransport::default());
        let registry = Arc::new(InterceptorRegistry::new());
        registry.set_blacklist(blacklist.iter().copied());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&network) as Arc<dyn Transport>,
            registry,
            Arc::clone(&store) as Arc<dyn RecordStore>,
        );
        (dispatcher, network, store)
    }

    #[test]
    fn test_can_intercept() {
        let (dispatcher, _, _) = dispatcher(&["internal.example"]);

        let request = Request::get("http://api.example.com/").body(()).unwrap();
        assert!(dispatcher.can_intercept(&request));

        let request = Request::get("http://db.internal.example/").body(()).unwrap();
        assert!(!dispatcher.can_intercept(&request));

        let mut request = Request::get("http://api.example.com/").body(()).unwrap();
        request.extensions_mut().insert(Intercepted);
        assert!(!dispatcher.can_intercept(&request));

        let request = Request::get("/relative").body(()).unwrap();
        assert!(!dispatcher.can_intercept(&request));
    }

    #[tokio::test]
    async fn test_intercepted_request_reaches_network_once() {
        let (dispatcher, network, store) = dispatcher(&[]);

        let request = Request::get("http://api.example.com/")
            .body(RequestBody::Empty)
            .unwrap();
        let call = dispatcher.open(request);

        // One network call, carrying the marker
        assert_eq!(*network.opened.lock().unwrap(), vec![true]);
        assert_eq!(store.len(), 1);
        call.cancel();
    }

    #[tokio::test]
    async fn test_filtered_request_passes_through() {
        let (dispatcher, network, store) = dispatcher(&["example.com"]);

        let request = Request::get("http://api.example.com/")
            .body(RequestBody::Empty)
            .unwrap();
        let _call = dispatcher.open(request);

        assert_eq!(*network.opened.lock().unwrap(), vec![false]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_call_tears_exchange_down() {
        let network = Arc::new(HangingTransport::default());
        let (dispatcher, store) = with_network(Arc::clone(&network) as Arc<dyn Transport>);

        let request = Request::get("http://api.example.com/")
            .body(RequestBody::Empty)
            .unwrap();
        drop(dispatcher.open(request));

        let record = finalized(&store).await;
        assert_eq!(record.error_description(), Some("cancelled"));
        assert!(record.duration_ms().is_some());
        assert_eq!(store.save_count(), 2);
        assert!(network.handles.lock().unwrap()[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_cache_policy_reaches_caller() {
        let (dispatcher, store) = with_network(Arc::new(OkTransport));

        let request = Request::get("http://api.example.com/")
            .header("cache-control", "no-store")
            .body(RequestBody::Empty)
            .unwrap();
        let response = dispatcher.open(request).into_response().await.unwrap();

        assert_eq!(
            response.extensions().get::<CacheStoragePolicy>(),
            Some(&CacheStoragePolicy::NotAllowed)
        );
        assert_eq!(finalized(&store).await.response().unwrap().status, 200);
    }
}
