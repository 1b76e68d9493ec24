use prometheus::{IntCounter, IntGauge, Opts, Registry};

#[derive(Clone)]
pub struct ProxyMetrics {
    pub active_sessions: IntGauge,
    pub sessions_total: IntCounter,
    pub lookup_failures: IntCounter,
    pub broker_connect_failures: IntCounter,
    pub frames_to_clients: IntCounter,
    pub frames_to_brokers: IntCounter,
}

impl ProxyMetrics {
    /// Create the proxy metrics and register them on `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            active_sessions: IntGauge::with_opts(Opts::new(
                "mqtt_proxy_active_sessions",
                "Number of client sessions currently open",
            ))?,
            sessions_total: IntCounter::with_opts(Opts::new(
                "mqtt_proxy_sessions_total",
                "Total number of client connections accepted",
            ))?,
            lookup_failures: IntCounter::with_opts(Opts::new(
                "mqtt_proxy_lookup_failures_total",
                "Broker lookups that failed and closed the client",
            ))?,
            broker_connect_failures: IntCounter::with_opts(Opts::new(
                "mqtt_proxy_broker_connect_failures_total",
                "Sessions whose broker leg failed before the handshake completed",
            ))?,
            frames_to_clients: IntCounter::with_opts(Opts::new(
                "mqtt_proxy_frames_to_clients_total",
                "Frames relayed from brokers to clients",
            ))?,
            frames_to_brokers: IntCounter::with_opts(Opts::new(
                "mqtt_proxy_frames_to_brokers_total",
                "Frames relayed from clients to brokers",
            ))?,
        };

        registry.register(Box::new(metrics.active_sessions.clone()))?;
        registry.register(Box::new(metrics.sessions_total.clone()))?;
        registry.register(Box::new(metrics.lookup_failures.clone()))?;
        registry.register(Box::new(metrics.broker_connect_failures.clone()))?;
        registry.register(Box::new(metrics.frames_to_clients.clone()))?;
        registry.register(Box::new(metrics.frames_to_brokers.clone()))?;

        Ok(metrics)
    }

    #[cfg(test)]
    pub(crate) fn unregistered() -> Self {
        Self::register(&Registry::new()).expect("fresh registry accepts proxy metrics")
    }
}
