use async_trait::async_trait;
use mqttrs::{Connack, Connect, ConnectReturnCode, Packet, Publish};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::ChannelHandle;
use crate::codec::{encode, Frame};
use crate::config::ProxyConfig;
use crate::error::SessionError;
use crate::events::{SystemEvent, SystemEventKind, SystemEventService};
use crate::exchanger::{BrokerEvent, Exchanger, ExchangerOwner, PacketIdTopics};
use crate::lookup::{LookupHandler, TopicName};
use crate::metrics::ProxyMetrics;
use crate::processor::ProtocolMethodProcessor;

/// Service-wide collaborators every session needs.
pub struct SessionContext {
    pub config: Arc<ProxyConfig>,
    pub lookup: Arc<dyn LookupHandler>,
    pub events: Arc<dyn SystemEventService>,
    pub metrics: ProxyMetrics,
}

/// Client leg plus the SUBACKs the client is still waiting for.
struct ClientLeg {
    channel: ChannelHandle,
    pending_subacks: HashSet<u16>,
    metrics: ProxyMetrics,
}

impl ExchangerOwner for ClientLeg {
    fn client(&self) -> &ChannelHandle {
        &self.channel
    }

    fn check_if_send_suback(&mut self, packet_id: u16) -> bool {
        self.pending_subacks.remove(&packet_id)
    }

    fn frame_relayed(&self) {
        self.metrics.frames_to_clients.inc();
    }
}

/// Looks up the broker on CONNECT, then forwards client packets to it once
/// the broker has accepted the session.
pub struct ProxyProtocolMethodProcessor {
    ctx: Arc<SessionContext>,
    session_id: Uuid,
    client_id: Option<String>,
    client: ClientLeg,
    exchanger: Option<Exchanger>,
    established: bool,
    handshake_deadline: Option<Instant>,
}

impl ProxyProtocolMethodProcessor {
    pub fn new(ctx: Arc<SessionContext>, session_id: Uuid, client: ChannelHandle) -> Self {
        let metrics = ctx.metrics.clone();
        Self {
            ctx,
            session_id,
            client_id: None,
            client: ClientLeg {
                channel: client,
                pending_subacks: HashSet::new(),
                metrics,
            },
            exchanger: None,
            established: false,
            handshake_deadline: None,
        }
    }

    pub fn exchanger(&self) -> Option<&Exchanger> {
        self.exchanger.as_ref()
    }

    /// True once the broker has accepted the session and the client has
    /// been answered.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Whether the next client frame may be read now. Before CONNECT the
    /// client is always read; afterwards only once the broker leg is ready
    /// and has room.
    pub fn accepts_client_frames(&self) -> bool {
        match &self.exchanger {
            None => true,
            Some(exchanger) => self.established && exchanger.is_writable(),
        }
    }

    /// Broker leg write side, for waiting on its queue to drain.
    pub fn broker_channel(&self) -> Option<ChannelHandle> {
        self.exchanger
            .as_ref()
            .and_then(|e| e.broker_channel())
            .cloned()
    }

    /// When the broker must have answered by, while a handshake is pending.
    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
    }

    /// Next event from the broker leg. Pends forever without one.
    pub async fn next_broker_event(&mut self) -> BrokerEvent {
        match self.exchanger.as_mut() {
            Some(exchanger) => exchanger.next_event().await,
            None => std::future::pending().await,
        }
    }

    /// Apply a broker event and, once the broker is ready, answer the client.
    pub async fn on_broker_event(&mut self, event: BrokerEvent) -> Result<(), SessionError> {
        let Some(exchanger) = self.exchanger.as_mut() else {
            return Ok(());
        };

        if let Err(e) = exchanger.on_broker_event(event, &mut self.client).await {
            if !self.established {
                self.ctx.metrics.broker_connect_failures.inc();
            }
            self.close_session();
            return Err(e);
        }

        if self.established {
            return Ok(());
        }
        self.check_readiness().await
    }

    async fn check_readiness(&mut self) -> Result<(), SessionError> {
        let Some(exchanger) = self.exchanger.as_ref() else {
            return Ok(());
        };

        match exchanger.connected_ack_state() {
            None => Ok(()),
            Some(Ok(())) => {
                let connack = exchanger
                    .broker_connack()
                    .cloned()
                    .ok_or_else(|| SessionError::Protocol("ready without CONNACK".to_string()))?;
                let broker = exchanger.broker_addr();

                self.client
                    .channel
                    .write_and_flush(connack.into_bytes())
                    .await
                    .map_err(|_| SessionError::Closed)?;
                self.established = true;
                self.handshake_deadline = None;

                let client_id = self.client_id.clone().unwrap_or_default();
                info!("Client {} connected through broker {}", client_id, broker);
                self.ctx
                    .events
                    .publish(SystemEvent::now(SystemEventKind::SessionEstablished {
                        client_id,
                        broker,
                    }));
                Ok(())
            }
            Some(Err(e)) => {
                warn!("Broker handshake failed: {}", e);
                // Let the client see the broker's own refusal code
                if let (SessionError::Refused(_), Some(connack)) = (&e, exchanger.broker_connack())
                {
                    let _ = self.client.channel.try_write(connack.as_bytes().clone());
                }
                self.ctx.metrics.broker_connect_failures.inc();
                self.close_session();
                Err(e)
            }
        }
    }

    /// Give up on a broker that never answered the CONNECT.
    pub async fn on_handshake_timeout(&mut self) -> SessionError {
        let timeout = self.ctx.config.handshake_timeout().unwrap_or_default();
        warn!("Broker did not acknowledge the session within {:?}", timeout);
        self.ctx.metrics.broker_connect_failures.inc();
        self.refuse_client().await;
        self.close_session();
        SessionError::HandshakeTimeout(timeout)
    }

    /// Answer the client with "server unavailable" before dropping it.
    async fn refuse_client(&self) {
        let refusal = Packet::Connack(Connack {
            session_present: false,
            code: ConnectReturnCode::ServerUnavailable,
        });
        match encode(&refusal) {
            Ok(frame) => {
                let _ = self.client.channel.write_and_flush(frame.into_bytes()).await;
            }
            Err(e) => warn!("Failed to encode CONNACK: {}", e),
        }
    }

    fn close_session(&mut self) {
        self.handshake_deadline = None;
        if let Some(exchanger) = self.exchanger.as_mut() {
            exchanger.close();
        }
        self.client.channel.close();
    }

    async fn forward(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let Some(exchanger) = self.exchanger.as_ref() else {
            return Err(SessionError::Protocol(
                "packet received before CONNECT".to_string(),
            ));
        };
        if !self.established {
            return Err(SessionError::Protocol(
                "packet received before the broker accepted the session".to_string(),
            ));
        }

        exchanger
            .write_and_flush(frame.as_bytes().clone())
            .await
            .map_err(|_| SessionError::TransportLost)?;
        self.ctx.metrics.frames_to_brokers.inc();
        Ok(())
    }

    fn complete_delivery(&mut self, packet_id: u16) {
        if let Some(exchanger) = self.exchanger.as_mut() {
            if let Some(topic) = exchanger.packet_id_topics_mut().remove(packet_id) {
                debug!("Delivery {} on {} completed", packet_id, topic);
            }
        }
    }
}

#[async_trait]
impl ProtocolMethodProcessor for ProxyProtocolMethodProcessor {
    async fn process_connect(
        &mut self,
        connect: &Connect<'_>,
        frame: &Frame,
    ) -> Result<(), SessionError> {
        if self.exchanger.is_some() {
            return Err(SessionError::Protocol("duplicate CONNECT".to_string()));
        }

        let config = &self.ctx.config;
        let local_name = if connect.client_id.is_empty() {
            self.session_id.to_string()
        } else {
            connect.client_id.to_string()
        };
        let topic = TopicName::new(
            config.common.default_tenant.as_str(),
            config.common.default_namespace.as_str(),
            local_name,
        );
        self.client_id = Some(connect.client_id.to_string());

        let broker = match self.ctx.lookup.find_broker(&topic).await {
            Ok(broker) => broker,
            Err(e) => {
                warn!("Lookup for {} failed: {}", topic, e);
                self.ctx.metrics.lookup_failures.inc();
                self.refuse_client().await;
                self.client.channel.close();
                return Err(SessionError::Lookup(e.to_string()));
            }
        };

        info!("Routing client {} to broker {}", connect.client_id, broker);
        self.exchanger = Some(Exchanger::connect(
            broker,
            frame.clone(),
            PacketIdTopics::default(),
            config.max_frame_size(),
            config.channel_capacity,
        ));
        self.handshake_deadline = config.handshake_timeout().map(|t| Instant::now() + t);
        Ok(())
    }

    async fn process_publish(
        &mut self,
        _publish: &Publish<'_>,
        frame: &Frame,
    ) -> Result<(), SessionError> {
        self.forward(frame).await
    }

    async fn process_pub_ack(
        &mut self,
        packet_id: u16,
        frame: &Frame,
    ) -> Result<(), SessionError> {
        self.complete_delivery(packet_id);
        self.forward(frame).await
    }

    async fn process_pub_rec(
        &mut self,
        _packet_id: u16,
        frame: &Frame,
    ) -> Result<(), SessionError> {
        self.forward(frame).await
    }

    async fn process_pub_rel(
        &mut self,
        _packet_id: u16,
        frame: &Frame,
    ) -> Result<(), SessionError> {
        self.forward(frame).await
    }

    async fn process_pub_comp(
        &mut self,
        packet_id: u16,
        frame: &Frame,
    ) -> Result<(), SessionError> {
        self.complete_delivery(packet_id);
        self.forward(frame).await
    }

    async fn process_subscribe(
        &mut self,
        packet_id: u16,
        frame: &Frame,
    ) -> Result<(), SessionError> {
        self.client.pending_subacks.insert(packet_id);
        self.forward(frame).await
    }

    async fn process_unsubscribe(
        &mut self,
        _packet_id: u16,
        frame: &Frame,
    ) -> Result<(), SessionError> {
        self.forward(frame).await
    }

    async fn process_ping_req(&mut self, frame: &Frame) -> Result<(), SessionError> {
        self.forward(frame).await
    }

    async fn process_disconnect(&mut self, frame: &Frame) -> Result<(), SessionError> {
        if self.established {
            if let Some(exchanger) = self.exchanger.as_ref() {
                let _ = exchanger.write_and_flush(frame.as_bytes().clone()).await;
            }
        }
        debug!("Client disconnected");
        self.close_session();
        Ok(())
    }

    async fn process_connection_lost(&mut self) {
        self.close_session();
        self.client.pending_subacks.clear();

        if self.established {
            self.established = false;
            self.ctx
                .events
                .publish(SystemEvent::now(SystemEventKind::SessionClosed {
                    client_id: self.client_id.clone().unwrap_or_default(),
                }));
        }
    }
}
