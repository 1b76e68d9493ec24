//! Broker leg of a proxied session.
//!
//! Has no task of its own: the session loop polls [`Exchanger::next_event`]
//! and feeds the result back through [`Exchanger::on_broker_event`].

use bytes::Bytes;
use mqttrs::{ConnectReturnCode, Packet, QosPid};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelHandle;
use crate::codec::{packet_name, CodecError, Frame, FrameReader};
use crate::error::{ChannelClosed, SessionError};
use crate::signal::ReadySignal;

/// Topic of every QoS>0 PUBLISH the broker has sent, by packet identifier.
///
/// Entries are overwritten when an identifier is reused and removed when the
/// client acknowledges the delivery.
#[derive(Debug, Default)]
pub struct PacketIdTopics {
    topics: HashMap<u16, String>,
}

impl PacketIdTopics {
    pub fn record(&mut self, packet_id: u16, topic: &str) {
        self.topics.insert(packet_id, topic.to_string());
    }

    pub fn topic(&self, packet_id: u16) -> Option<&str> {
        self.topics.get(&packet_id).map(String::as_str)
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<String> {
        self.topics.remove(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// What the exchanger needs from the session that owns it.
pub trait ExchangerOwner {
    /// Write side of the client leg.
    fn client(&self) -> &ChannelHandle;

    /// Whether a SUBACK for `packet_id` should be passed to the client.
    /// Answering true consumes the expectation.
    fn check_if_send_suback(&mut self, packet_id: u16) -> bool;

    /// Called after each frame relayed to the client.
    fn frame_relayed(&self) {}
}

/// Something that happened on the broker leg.
#[derive(Debug)]
pub enum BrokerEvent {
    /// Transport is up and CONNECT has been queued.
    Connected,
    ConnectFailed(io::Error),
    Frame(Frame),
    /// Undecodable or oversized input.
    Failed(CodecError),
    /// Broker transport closed or broke.
    Closed,
}

enum Action {
    Relay,
    /// Kept for the session to answer its client with.
    Hold,
    Drop,
}

enum LegState {
    Connecting(JoinHandle<io::Result<TcpStream>>),
    Open(FrameReader<OwnedReadHalf>),
    Closed,
}

pub struct Exchanger {
    broker_addr: SocketAddr,
    state: LegState,
    broker: Option<ChannelHandle>,
    connect_frame: Bytes,
    packet_id_topics: PacketIdTopics,
    connected: ReadySignal,
    acknowledged: ReadySignal,
    broker_connack: Option<Frame>,
    max_frame_size: usize,
    channel_capacity: usize,
}

impl Exchanger {
    /// Start connecting to `broker_addr` on the current runtime. The outcome
    /// is reported by [`Exchanger::next_event`].
    pub fn connect(
        broker_addr: SocketAddr,
        connect_frame: Frame,
        packet_id_topics: PacketIdTopics,
        max_frame_size: usize,
        channel_capacity: usize,
    ) -> Self {
        debug!("Connecting to broker {}", broker_addr);
        Self {
            broker_addr,
            state: LegState::Connecting(tokio::spawn(TcpStream::connect(broker_addr))),
            broker: None,
            connect_frame: connect_frame.into_bytes(),
            packet_id_topics,
            connected: ReadySignal::new(),
            acknowledged: ReadySignal::new(),
            broker_connack: None,
            max_frame_size,
            channel_capacity,
        }
    }

    pub fn broker_addr(&self) -> SocketAddr {
        self.broker_addr
    }

    /// Wait for the next broker-side event. Cancel safe.
    ///
    /// Pends forever once the leg is closed.
    pub async fn next_event(&mut self) -> BrokerEvent {
        match &mut self.state {
            LegState::Connecting(connecting) => {
                let result = connecting.await.unwrap_or_else(|e| Err(io::Error::other(e)));
                self.on_connect_result(result)
            }
            LegState::Open(reader) => match reader.next_frame().await {
                Ok(Some(frame)) => BrokerEvent::Frame(frame),
                Ok(None) => BrokerEvent::Closed,
                Err(CodecError::Io(e)) => {
                    debug!("Read from broker {} failed: {}", self.broker_addr, e);
                    BrokerEvent::Closed
                }
                Err(e) => BrokerEvent::Failed(e),
            },
            LegState::Closed => std::future::pending().await,
        }
    }

    fn on_connect_result(&mut self, result: io::Result<TcpStream>) -> BrokerEvent {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.state = LegState::Closed;
                self.connected.fail(SessionError::BrokerConnect {
                    addr: self.broker_addr,
                    reason: e.to_string(),
                });
                return BrokerEvent::ConnectFailed(e);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY towards {}: {}", self.broker_addr, e);
        }
        let (read_half, write_half) = stream.into_split();
        let broker = ChannelHandle::spawn(write_half, self.broker_addr, self.channel_capacity);

        // CONNECT goes out before anything else; the queue is empty so this
        // cannot be refused for lack of space.
        if broker.try_write(self.connect_frame.clone()).is_err() {
            broker.close();
        }

        self.state = LegState::Open(FrameReader::new(read_half, self.max_frame_size));
        self.broker = Some(broker);
        self.connected.complete();
        BrokerEvent::Connected
    }

    /// Apply one broker event. An error means the session is over: the
    /// readiness signals have been failed and both legs closed, except for
    /// a failed connect, which leaves the client leg to the owner.
    pub async fn on_broker_event<O>(
        &mut self,
        event: BrokerEvent,
        owner: &mut O,
    ) -> Result<(), SessionError>
    where
        O: ExchangerOwner + ?Sized,
    {
        match event {
            BrokerEvent::Connected => {
                info!("Connected to broker {}", self.broker_addr);
                Ok(())
            }
            BrokerEvent::ConnectFailed(e) => {
                error!("Failed to connect to broker {}: {}", self.broker_addr, e);
                Err(SessionError::BrokerConnect {
                    addr: self.broker_addr,
                    reason: e.to_string(),
                })
            }
            BrokerEvent::Frame(frame) => match self.handle_broker_frame(frame, owner).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!("Failed to process frame from broker {}: {}", self.broker_addr, e);
                    self.fail_session(e.clone(), owner);
                    Err(e)
                }
            },
            BrokerEvent::Failed(e) => {
                let err = SessionError::from(e);
                error!("Broker {} sent bad data: {}", self.broker_addr, err);
                self.fail_session(err.clone(), owner);
                Err(err)
            }
            BrokerEvent::Closed => {
                info!("Broker {} closed the connection", self.broker_addr);
                self.fail_session(SessionError::TransportLost, owner);
                Err(SessionError::TransportLost)
            }
        }
    }

    async fn handle_broker_frame<O>(&mut self, frame: Frame, owner: &mut O) -> Result<(), SessionError>
    where
        O: ExchangerOwner + ?Sized,
    {
        let action = {
            let packet = frame.packet()?;
            debug!("Broker sent {}", packet_name(&packet));

            match &packet {
                Packet::Connack(connack) => {
                    if self.acknowledged.is_resolved() {
                        warn!("Ignoring repeated CONNACK from {}", self.broker_addr);
                        Action::Drop
                    } else {
                        if matches!(connack.code, ConnectReturnCode::Accepted) {
                            self.acknowledged.complete();
                        } else {
                            self.acknowledged
                                .fail(SessionError::Refused(format!("{:?}", connack.code)));
                        }
                        Action::Hold
                    }
                }
                Packet::Suback(suback) => {
                    let pid = suback.pid.get();
                    if owner.check_if_send_suback(pid) {
                        Action::Relay
                    } else {
                        debug!("Dropping SUBACK {} nobody is waiting for", pid);
                        Action::Drop
                    }
                }
                Packet::Publish(publish) => {
                    match publish.qospid {
                        QosPid::AtLeastOnce(pid) | QosPid::ExactlyOnce(pid) => {
                            self.packet_id_topics.record(pid.get(), publish.topic_name)
                        }
                        QosPid::AtMostOnce => {}
                    }
                    Action::Relay
                }
                _ => Action::Relay,
            }
        };

        match action {
            Action::Relay => {}
            Action::Hold => {
                self.broker_connack = Some(frame);
                return Ok(());
            }
            Action::Drop => return Ok(()),
        }

        owner
            .client()
            .write_and_flush(frame.into_bytes())
            .await
            .map_err(|_| SessionError::Closed)?;
        owner.frame_relayed();
        Ok(())
    }

    fn fail_session<O>(&mut self, err: SessionError, owner: &mut O)
    where
        O: ExchangerOwner + ?Sized,
    {
        self.acknowledged.fail(err);
        self.close();
        owner.client().close();
    }

    /// Resolves once the broker transport is up and the broker has accepted
    /// the CONNECT. Fails as soon as either step fails.
    pub fn connected_ack(&self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        self.connected.then(&self.acknowledged)
    }

    /// Non-blocking view of [`Exchanger::connected_ack`]; `None` while pending.
    pub fn connected_ack_state(&self) -> Option<Result<(), SessionError>> {
        self.connected.peek_then(&self.acknowledged)
    }

    /// The broker's CONNACK, once it has arrived.
    pub fn broker_connack(&self) -> Option<&Frame> {
        self.broker_connack.as_ref()
    }

    /// True while the broker transport is open and can take more frames.
    pub fn is_writable(&self) -> bool {
        self.broker.as_ref().is_some_and(ChannelHandle::is_writable)
    }

    /// Write side of the broker leg, once connected.
    pub fn broker_channel(&self) -> Option<&ChannelHandle> {
        self.broker.as_ref()
    }

    /// True until the broker leg has been closed.
    pub fn is_open(&self) -> bool {
        !matches!(self.state, LegState::Closed)
    }

    /// Forward a client frame to the broker.
    pub async fn write_and_flush(&self, frame: Bytes) -> Result<(), ChannelClosed> {
        match &self.broker {
            Some(broker) => broker.write_and_flush(frame).await,
            None => Err(ChannelClosed {
                peer: self.broker_addr,
            }),
        }
    }

    /// Close the broker transport. Idempotent. The packet identifier map is
    /// left untouched.
    pub fn close(&mut self) {
        if matches!(self.state, LegState::Closed) && self.broker.is_none() {
            return;
        }
        debug!("Closing broker leg to {}", self.broker_addr);
        if let LegState::Connecting(connecting) = &self.state {
            connecting.abort();
        }
        self.state = LegState::Closed;
        if let Some(broker) = self.broker.take() {
            broker.close();
        }
        self.connected.fail(SessionError::Closed);
        self.acknowledged.fail(SessionError::Closed);
    }

    pub fn packet_id_topics(&self) -> &PacketIdTopics {
        &self.packet_id_topics
    }

    pub fn packet_id_topics_mut(&mut self) -> &mut PacketIdTopics {
        &mut self.packet_id_topics
    }
}

impl Drop for Exchanger {
    fn drop(&mut self) {
        if let LegState::Connecting(connecting) = &self.state {
            connecting.abort();
        }
    }
}
