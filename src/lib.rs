pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod exchanger;
pub mod handshake;
pub mod lookup;
pub mod metrics;
pub mod mqtt_listener;
pub mod processor;
pub mod proxy;
pub mod proxy_processor;
pub mod signal;

pub use config::ProxyConfig;
pub use error::{ProxyError, SessionError};
pub use exchanger::Exchanger;
pub use handshake::{Handshake, PlainHandshake, TlsHandshake};
pub use lookup::{LookupHandler, ServiceUrlLookupHandler, TopicName};
pub use mqtt_listener::ListenerKind;
pub use processor::ProtocolMethodProcessor;
pub use proxy::MqttProxyService;
