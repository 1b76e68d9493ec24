use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::events::{BroadcastSystemEventService, DisabledSystemEventService, SystemEventService};
use crate::handshake::{Handshake, PlainHandshake, TlsHandshake};
use crate::lookup::{LookupHandler, ServiceUrlLookupHandler};
use crate::metrics::ProxyMetrics;
use crate::mqtt_listener::{ListenerKind, MqttListener};
use crate::proxy_processor::SessionContext;

/// How long runtimes get to stop once sessions have drained or timed out.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// The proxy as embedded in a host process.
///
/// Owns the acceptor and worker thread pools, the client-facing listeners
/// and the lookup service. `start` and `close` block the calling thread and
/// must not be called from inside an async context.
pub struct MqttProxyService {
    config: Arc<ProxyConfig>,
    acceptor: Option<Runtime>,
    worker: Option<Runtime>,
    listeners: Vec<MqttListener>,
    psk_handshake: Option<Arc<dyn Handshake>>,
    lookup: Option<Arc<dyn LookupHandler>>,
    events: Arc<dyn SystemEventService>,
    registry: Registry,
    metrics: ProxyMetrics,
    sessions: TaskTracker,
    started: bool,
    closed: bool,
}

impl MqttProxyService {
    /// Validate `config` and build the thread pools. Nothing is bound yet.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;

        let acceptor = Builder::new_multi_thread()
            .worker_threads(config.num_acceptor_threads)
            .thread_name("mqtt-redirect-acceptor")
            .enable_all()
            .build()
            .map_err(|source| ProxyError::Runtime {
                name: "acceptor",
                source,
            })?;
        let worker = Builder::new_multi_thread()
            .worker_threads(config.num_io_threads)
            .thread_name("mqtt-redirect-io")
            .enable_all()
            .build()
            .map_err(|source| ProxyError::Runtime {
                name: "worker",
                source,
            })?;

        let registry = Registry::new();
        let metrics = ProxyMetrics::register(&registry)?;

        let events: Arc<dyn SystemEventService> = if config.system_event_enabled {
            Arc::new(BroadcastSystemEventService::new())
        } else {
            Arc::new(DisabledSystemEventService)
        };

        info!(
            "MQTT proxy configured: {} acceptor thread(s), {} I/O thread(s)",
            config.num_acceptor_threads, config.num_io_threads
        );

        Ok(Self {
            config: Arc::new(config),
            acceptor: Some(acceptor),
            worker: Some(worker),
            listeners: Vec::new(),
            psk_handshake: None,
            lookup: None,
            events,
            registry,
            metrics,
            sessions: TaskTracker::new(),
            started: false,
            closed: false,
        })
    }

    /// Handshake run on connections to the TLS-PSK listener. Required when
    /// `tls_psk.enabled` is set.
    pub fn with_psk_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.psk_handshake = Some(handshake);
        self
    }

    /// Bind every enabled listener, then bring up the lookup and event
    /// services and begin accepting clients.
    ///
    /// A failed bind leaves the listeners bound before it open; call
    /// [`MqttProxyService::close`] to release them.
    pub fn start(&mut self) -> Result<(), ProxyError> {
        if self.closed {
            return Err(ProxyError::Closed);
        }
        if self.started {
            return Err(ProxyError::AlreadyStarted);
        }
        self.started = true;

        let psk_handshake = match (&self.psk_handshake, self.config.tls_psk.enabled) {
            (Some(handshake), true) => Some(Arc::clone(handshake)),
            (None, true) => {
                return Err(ProxyError::Configuration(
                    "tls_psk is enabled but no PSK handshake was provided".to_string(),
                ))
            }
            (_, false) => None,
        };

        let config = Arc::clone(&self.config);
        let host = config.bind_address.as_str();
        let mut handshakes: Vec<Arc<dyn Handshake>> = Vec::new();

        self.listeners
            .push(MqttListener::bind(ListenerKind::Plain, host, config.mqtt_proxy_port)?);
        handshakes.push(Arc::new(PlainHandshake));

        if config.tls.enabled {
            let tls = TlsHandshake::from_config(&config.tls)?;
            self.listeners
                .push(MqttListener::bind(ListenerKind::Tls, host, config.tls.port)?);
            handshakes.push(Arc::new(tls));
        }

        if let Some(psk) = psk_handshake {
            self.listeners
                .push(MqttListener::bind(ListenerKind::TlsPsk, host, config.tls_psk.port)?);
            handshakes.push(psk);
        }

        let lookup: Arc<dyn LookupHandler> = Arc::new(ServiceUrlLookupHandler::new(&config)?);
        self.lookup = Some(Arc::clone(&lookup));
        self.events.start();

        let ctx = Arc::new(SessionContext {
            config: Arc::clone(&config),
            lookup,
            events: Arc::clone(&self.events),
            metrics: self.metrics.clone(),
        });

        let (Some(acceptor), Some(worker)) = (&self.acceptor, &self.worker) else {
            return Err(ProxyError::Closed);
        };
        for (listener, handshake) in self.listeners.iter_mut().zip(handshakes) {
            listener.start(
                acceptor.handle(),
                worker.handle().clone(),
                handshake,
                Arc::clone(&ctx),
                self.sessions.clone(),
            )?;
        }

        info!(
            "MQTT proxy started with {} listener(s), brokers at {}",
            self.listeners.len(),
            config.broker_service_url
        );
        Ok(())
    }

    /// Stop accepting, stop the collaborators, then let open sessions finish
    /// for up to `shutdown_timeout_ms` before the thread pools are shut down.
    /// Calling it again does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("Closing MQTT proxy");

        for listener in &mut self.listeners {
            if let Some(accept_task) = listener.close() {
                if let Some(acceptor) = &self.acceptor {
                    let _ = acceptor.block_on(accept_task);
                }
            }
        }
        self.listeners.clear();

        self.events.close();
        if let Some(lookup) = self.lookup.take() {
            lookup.close();
        }

        self.sessions.close();
        if let Some(worker) = self.worker.take() {
            let grace = self.config.shutdown_timeout();
            let sessions = self.sessions.clone();
            let drained = worker.block_on(async move {
                tokio::time::timeout(grace, sessions.wait()).await.is_ok()
            });
            if !drained {
                warn!(
                    "{} session(s) still open after {:?}, shutting down anyway",
                    self.sessions.len(),
                    grace
                );
            }
            worker.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        }
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        }

        info!("MQTT proxy closed");
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Addresses of the listeners currently bound.
    pub fn local_addrs(&self) -> Vec<(ListenerKind, SocketAddr)> {
        self.listeners
            .iter()
            .map(|l| (l.kind(), l.local_addr()))
            .collect()
    }

    pub fn local_addr(&self, kind: ListenerKind) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.kind() == kind)
            .map(MqttListener::local_addr)
    }

    pub fn bound_listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Registry holding the proxy's metrics, for the host to export.
    pub fn metrics_registry(&self) -> &Registry {
        &self.registry
    }

    pub fn event_service(&self) -> Arc<dyn SystemEventService> {
        Arc::clone(&self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config() -> ProxyConfig {
        let mut config = ProxyConfig::new("mqtt://127.0.0.1:1883", "public");
        config.bind_address = "127.0.0.1".to_string();
        config.mqtt_proxy_port = free_port();
        config.num_io_threads = 2;
        config.shutdown_timeout_ms = 500;
        config
    }

    #[test]
    fn test_invalid_config_is_rejected_before_binding() {
        let mut config = test_config();
        config.common.default_tenant = String::new();
        assert!(matches!(
            MqttProxyService::new(config),
            Err(ProxyError::Configuration(_))
        ));
    }

    #[test]
    fn test_start_twice_and_after_close() {
        let mut service = MqttProxyService::new(test_config()).unwrap();
        service.start().unwrap();
        assert!(matches!(service.start(), Err(ProxyError::AlreadyStarted)));

        service.close();
        assert!(matches!(service.start(), Err(ProxyError::Closed)));
    }

    #[test]
    fn test_psk_without_handshake_is_rejected() {
        let mut config = test_config();
        config.tls_psk.enabled = true;
        config.tls_psk.port = free_port();

        let mut service = MqttProxyService::new(config).unwrap();
        assert!(matches!(
            service.start(),
            Err(ProxyError::Configuration(_))
        ));
        assert_eq!(service.bound_listener_count(), 0);
        service.close();
    }

    #[test]
    fn test_disabled_events_reject_subscribers() {
        let mut service = MqttProxyService::new(test_config()).unwrap();
        service.start().unwrap();
        assert!(service.event_service().subscribe().is_err());
        service.close();
    }

    #[test]
    fn test_close_before_start() {
        let mut service = MqttProxyService::new(test_config()).unwrap();
        service.close();
        service.close();
        assert_eq!(service.bound_listener_count(), 0);
    }
}
