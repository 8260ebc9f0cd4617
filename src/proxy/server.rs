//! Proxy server: accepts client connections and serves them over HTTP/1.1

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::intercept::Dispatcher;
use crate::network::HyperTransport;
use crate::registry::InterceptorRegistry;
use crate::Result;

use super::connection_pool::ConnectionPool;
use super::http::HttpProxy;
use super::SHUTDOWN_TIMEOUT_MS;

/// Forward-proxy server
pub struct ProxyServer {
    proxy: HttpProxy,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Create a server around `proxy`
    #[must_use]
    pub fn new(proxy: HttpProxy, max_connections: usize) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            proxy,
            connection_pool: ConnectionPool::new(max_connections),
            shutdown_tx,
        }
    }

    /// Wire up the full pipeline from configuration: hyper transport,
    /// dispatcher on the process-wide registry, configured record store.
    ///
    /// # Errors
    ///
    /// Returns error if the record store cannot be opened
    pub fn from_config(config: &Config) -> Result<Self> {
        let network = HyperTransport::with_config(&config.transport)
            .max_redirects(config.limits.max_redirects)
            .event_buffer(config.limits.event_buffer);

        let registry = InterceptorRegistry::global();
        registry.replace(config.filter.clone());

        let dispatcher = Dispatcher::new(Arc::new(network), registry, config.store()?)
            .with_event_buffer(config.limits.event_buffer);

        Ok(Self::new(
            HttpProxy::new(Arc::new(dispatcher)),
            config.limits.max_connections,
        ))
    }

    /// Sender that stops the server when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind `addr` and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until Ctrl-C or a shutdown signal
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Proxy listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let Some(guard) = self.connection_pool.try_acquire() else {
                                warn!("Connection limit reached, rejecting {}", peer_addr);
                                drop(stream);
                                continue;
                            };

                            let proxy = self.proxy.clone();
                            connections.spawn(async move {
                                let _guard = guard;
                                serve_connection(stream, peer_addr, proxy).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result {
                        warn!("Connection task failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        // Let in-flight exchanges finish, then drop the rest
        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = connections.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await
        .ok();

        info!("Shutdown complete");
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, peer_addr: SocketAddr, proxy: HttpProxy) {
    let service = service_fn(move |request: Request<Incoming>| {
        let proxy = proxy.clone();
        async move { Ok::<_, Infallible>(proxy.handle(request).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("Connection from {} ended with error: {}", peer_addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{CallHandle, ForwardCall, RequestBody, Transport};
    use tokio::sync::mpsc;

    struct NullTransport;

    impl Transport for NullTransport {
        fn open(&self, _request: Request<RequestBody>) -> ForwardCall {
            let (_tx, rx) = mpsc::channel(1);
            ForwardCall::new(rx, CallHandle::new())
        }
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let server = ProxyServer::new(HttpProxy::new(Arc::new(NullTransport)), 10);
        assert_eq!(server.connection_pool.max_connections(), 10);

        let shutdown = server.shutdown_handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = tokio::spawn(async move { server.serve(listener).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(()).ok();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }

    #[test]
    fn test_from_config_uses_memory_store() {
        let config: Config = toml::from_str("listen_port = 8080").unwrap();
        let server = ProxyServer::from_config(&config).unwrap();
        assert_eq!(server.connection_pool.max_connections(), 4096);
    }
}
