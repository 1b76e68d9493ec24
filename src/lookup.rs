use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ProxyConfig;

/// Port used when the service URL does not name one.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("invalid broker service URL '{url}': {reason}")]
    InvalidServiceUrl { url: String, reason: String },

    #[error("too many outstanding lookup requests (limit {limit})")]
    TooManyRequests { limit: usize },

    #[error("failed to resolve broker for topic {topic}: {reason}")]
    Resolve { topic: String, reason: String },

    #[error("no broker address found for topic {topic}")]
    NotFound { topic: String },

    #[error("lookup service is closed")]
    Closed,
}

/// Fully qualified topic name, `persistent://tenant/namespace/local`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    pub tenant: String,
    pub namespace: String,
    pub local_name: String,
}

impl TopicName {
    pub fn new(
        tenant: impl Into<String>,
        namespace: impl Into<String>,
        local_name: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            namespace: namespace.into(),
            local_name: local_name.into(),
        }
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "persistent://{}/{}/{}",
            self.tenant, self.namespace, self.local_name
        )
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LookupHandler: Send + Sync {
    /// Address of the broker currently responsible for `topic`.
    async fn find_broker(&self, topic: &TopicName) -> Result<SocketAddr, LookupError>;

    /// Stop serving lookups. Pending and later calls fail with
    /// [`LookupError::Closed`].
    fn close(&self);
}

/// Bounds outstanding (queued + running) and concurrently running lookups.
#[derive(Debug)]
pub struct LookupLimiter {
    max_outstanding: usize,
    outstanding: AtomicUsize,
    concurrent: Semaphore,
}

/// Held for the duration of one lookup.
#[derive(Debug)]
pub struct LookupPermit<'a> {
    limiter: &'a LookupLimiter,
    _running: SemaphorePermit<'a>,
}

impl Drop for LookupPermit<'_> {
    fn drop(&mut self) {
        self.limiter.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl LookupLimiter {
    pub fn new(max_outstanding: usize, max_concurrent: usize) -> Self {
        Self {
            max_outstanding,
            outstanding: AtomicUsize::new(0),
            concurrent: Semaphore::new(max_concurrent),
        }
    }

    /// Reserve a slot, waiting for a concurrency permit if needed. Fails
    /// immediately when the outstanding limit is reached.
    pub async fn acquire(&self) -> Result<LookupPermit<'_>, LookupError> {
        let previous = self.outstanding.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_outstanding {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(LookupError::TooManyRequests {
                limit: self.max_outstanding,
            });
        }

        match self.concurrent.acquire().await {
            Ok(running) => Ok(LookupPermit {
                limiter: self,
                _running: running,
            }),
            Err(_) => {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                Err(LookupError::Closed)
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Wake every waiter with [`LookupError::Closed`].
    pub fn close(&self) {
        self.concurrent.close();
    }
}

/// Resolves every topic to the host named by the broker service URL.
pub struct ServiceUrlLookupHandler {
    service_url: String,
    host: String,
    port: u16,
    limiter: LookupLimiter,
    closed: AtomicBool,
}

impl ServiceUrlLookupHandler {
    pub fn new(config: &ProxyConfig) -> Result<Self, LookupError> {
        let (host, port) = parse_service_url(&config.broker_service_url)?;
        info!(
            "Lookup bound to {} (max outstanding {}, max concurrent {})",
            config.broker_service_url, config.max_lookup_request, config.concurrent_lookup_request
        );
        Ok(Self {
            service_url: config.broker_service_url.clone(),
            host,
            port,
            limiter: LookupLimiter::new(
                config.max_lookup_request,
                config.concurrent_lookup_request,
            ),
            closed: AtomicBool::new(false),
        })
    }

    pub fn service_url(&self) -> &str {
        &self.service_url
    }
}

#[async_trait]
impl LookupHandler for ServiceUrlLookupHandler {
    async fn find_broker(&self, topic: &TopicName) -> Result<SocketAddr, LookupError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LookupError::Closed);
        }

        let _permit = self.limiter.acquire().await?;
        debug!("Looking up broker for {}", topic);

        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| LookupError::Resolve {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        match addrs.next() {
            Some(addr) => {
                debug!("Broker for {} is {}", topic, addr);
                Ok(addr)
            }
            None => {
                warn!("No address found for {}", self.service_url);
                Err(LookupError::NotFound {
                    topic: topic.to_string(),
                })
            }
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.limiter.close();
            info!("Lookup service closed");
        }
    }
}

/// Split `mqtt://host:port` into host and port.
pub fn parse_service_url(service_url: &str) -> Result<(String, u16), LookupError> {
    let invalid = |reason: &str| LookupError::InvalidServiceUrl {
        url: service_url.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(service_url).map_err(|e| invalid(&e.to_string()))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?;
    // IPv6 literals come back bracketed
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port().unwrap_or(DEFAULT_BROKER_PORT);
    Ok((host.to_string(), port))
}
