use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::ReadHalf;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::channel::ChannelHandle;
use crate::codec::{CodecError, Frame, FrameReader};
use crate::error::{ProxyError, SessionError};
use crate::handshake::{ClientStream, Handshake};
use crate::processor::{dispatch, ProtocolMethodProcessor};
use crate::proxy_processor::{ProxyProtocolMethodProcessor, SessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Plain,
    Tls,
    TlsPsk,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerKind::Plain => "plain",
            ListenerKind::Tls => "TLS",
            ListenerKind::TlsPsk => "TLS-PSK",
        };
        f.write_str(name)
    }
}

/// A bound client-facing socket.
///
/// Binding and accepting are separate steps so the service can bind every
/// listener before any client is let in.
pub struct MqttListener {
    kind: ListenerKind,
    local_addr: SocketAddr,
    bound: Option<std::net::TcpListener>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl MqttListener {
    pub fn bind(kind: ListenerKind, host: &str, port: u16) -> Result<Self, ProxyError> {
        let bind_error = |source| ProxyError::Bind {
            kind,
            addr: format!("{}:{}", host, port),
            source,
        };

        let listener = std::net::TcpListener::bind((host, port)).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!("MQTT {} listener bound on {}", kind, local_addr);
        Ok(Self {
            kind,
            local_addr,
            bound: Some(listener),
            shutdown: CancellationToken::new(),
            accept_task: None,
        })
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept on `acceptor`; every accepted connection runs on `worker` and
    /// is tracked by `sessions`.
    pub fn start(
        &mut self,
        acceptor: &Handle,
        worker: Handle,
        handshake: Arc<dyn Handshake>,
        ctx: Arc<SessionContext>,
        sessions: TaskTracker,
    ) -> Result<(), ProxyError> {
        let Some(bound) = self.bound.take() else {
            return Ok(());
        };

        let listener = {
            let _guard = acceptor.enter();
            TcpListener::from_std(bound).map_err(|source| ProxyError::Bind {
                kind: self.kind,
                addr: self.local_addr.to_string(),
                source,
            })?
        };

        let accept = AcceptLoop {
            kind: self.kind,
            local_addr: self.local_addr,
            worker,
            handshake,
            ctx,
            sessions,
            shutdown: self.shutdown.clone(),
        };
        self.accept_task = Some(acceptor.spawn(accept.run(listener)));
        Ok(())
    }

    /// Stop accepting. The socket is released once the returned accept task
    /// has finished; a listener that never started releases it immediately.
    pub fn close(&mut self) -> Option<JoinHandle<()>> {
        self.shutdown.cancel();
        self.bound = None;
        self.accept_task.take()
    }
}

struct AcceptLoop {
    kind: ListenerKind,
    local_addr: SocketAddr,
    worker: Handle,
    handshake: Arc<dyn Handshake>,
    ctx: Arc<SessionContext>,
    sessions: TaskTracker,
    shutdown: CancellationToken,
}

impl AcceptLoop {
    async fn run(self, listener: TcpListener) {
        info!("MQTT {} listener started on {}", self.kind, self.local_addr);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("New {} connection from {}", self.kind, peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }

                    let kind = self.kind;
                    let handshake = Arc::clone(&self.handshake);
                    let ctx = Arc::clone(&self.ctx);
                    self.sessions.spawn_on(
                        async move {
                            match handshake.accept(stream).await {
                                Ok(stream) => handle_client(stream, peer, ctx).await,
                                Err(e) => warn!("{} handshake with {} failed: {}", kind, peer, e),
                            }
                        },
                        &self.worker,
                    );
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("MQTT {} listener on {} closed", self.kind, self.local_addr);
    }
}

/// Run one client session to completion.
pub async fn handle_client(stream: ClientStream, peer: SocketAddr, ctx: Arc<SessionContext>) {
    let session_id = Uuid::new_v4();
    let span = info_span!("session", id = %session_id, peer = %peer);
    run_session(stream, peer, session_id, ctx)
        .instrument(span)
        .await
}

async fn run_session(
    stream: ClientStream,
    peer: SocketAddr,
    session_id: Uuid,
    ctx: Arc<SessionContext>,
) {
    let metrics = ctx.metrics.clone();
    metrics.sessions_total.inc();
    metrics.active_sessions.inc();
    info!("New client connection from {}", peer);

    let (read_half, write_half) = tokio::io::split(stream);
    let client = ChannelHandle::spawn(write_half, peer, ctx.config.channel_capacity);
    let mut reader = FrameReader::new(read_half, ctx.config.max_frame_size());
    let mut processor = ProxyProtocolMethodProcessor::new(ctx, session_id, client.clone());

    match session_loop(&mut reader, &mut processor, &client).await {
        Ok(()) => debug!("Session finished"),
        Err(e) => warn!("Session failed: {}", e),
    }

    processor.process_connection_lost().await;
    client.close();
    metrics.active_sessions.dec();
    info!("Client {} disconnected", peer);
}

async fn session_loop(
    reader: &mut FrameReader<ReadHalf<ClientStream>>,
    processor: &mut ProxyProtocolMethodProcessor,
    client: &ChannelHandle,
) -> Result<(), SessionError> {
    loop {
        let reading = processor.accepts_client_frames();
        let deadline = processor.handshake_deadline();
        // Client reads pause while the broker queue is full
        let stalled_broker = processor
            .broker_channel()
            .filter(|broker| processor.is_established() && !reading && !broker.is_closed());

        tokio::select! {
            biased;
            _ = client.closed() => return Ok(()),
            event = processor.next_broker_event() => processor.on_broker_event(event).await?,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                return Err(processor.on_handshake_timeout().await);
            }
            _ = writable(stalled_broker.as_ref()), if stalled_broker.is_some() => {}
            input = client_input(reader, reading) => match input {
                ClientInput::Frame(Some(frame)) => {
                    if !dispatch(processor, &frame).await? {
                        return Ok(());
                    }
                }
                ClientInput::Buffered => {}
                ClientInput::Frame(None) => {
                    debug!("Client closed the connection");
                    return Ok(());
                }
                ClientInput::Failed(CodecError::Io(e)) => {
                    debug!("Client connection lost: {}", e);
                    return Ok(());
                }
                ClientInput::Failed(e) => return Err(e.into()),
            },
        }
    }
}

enum ClientInput {
    Frame(Option<Frame>),
    /// Bytes were buffered while frames are not being taken.
    Buffered,
    Failed(CodecError),
}

/// Next client frame, or while reads are paused, just watch for the client
/// going away.
async fn client_input(
    reader: &mut FrameReader<ReadHalf<ClientStream>>,
    reading: bool,
) -> ClientInput {
    if reading {
        return match reader.next_frame().await {
            Ok(frame) => ClientInput::Frame(frame),
            Err(e) => ClientInput::Failed(e),
        };
    }
    match reader.fill().await {
        Ok(true) => ClientInput::Buffered,
        Ok(false) => ClientInput::Frame(None),
        Err(e) => ClientInput::Failed(e),
    }
}

async fn writable(broker: Option<&ChannelHandle>) {
    match broker {
        Some(broker) => {
            let _ = broker.writable().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_packets;
    use crate::config::ProxyConfig;
    use crate::events::DisabledSystemEventService;
    use crate::lookup::MockLookupHandler;
    use crate::metrics::ProxyMetrics;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn context(broker: SocketAddr, config: ProxyConfig) -> Arc<SessionContext> {
        let mut lookup = MockLookupHandler::new();
        lookup.expect_find_broker().returning(move |_| Ok(broker));
        Arc::new(SessionContext {
            config: Arc::new(config),
            lookup: Arc::new(lookup),
            events: Arc::new(DisabledSystemEventService),
            metrics: ProxyMetrics::unregistered(),
        })
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_listener_kind_display() {
        assert_eq!(ListenerKind::Plain.to_string(), "plain");
        assert_eq!(ListenerKind::Tls.to_string(), "TLS");
        assert_eq!(ListenerKind::TlsPsk.to_string(), "TLS-PSK");
    }

    #[test]
    fn test_bind_conflict_names_listener() {
        let mut first = MqttListener::bind(ListenerKind::Plain, "127.0.0.1", 0).unwrap();
        let port = first.local_addr().port();

        match MqttListener::bind(ListenerKind::Tls, "127.0.0.1", port) {
            Err(ProxyError::Bind { kind, addr, .. }) => {
                assert_eq!(kind, ListenerKind::Tls);
                assert_eq!(addr, format!("127.0.0.1:{}", port));
            }
            other => panic!("expected bind error, got {:?}", other.map(|l| l.local_addr())),
        }

        // Closing an unstarted listener releases the port straight away
        assert!(first.close().is_none());
        let mut again = MqttListener::bind(ListenerKind::Plain, "127.0.0.1", port).unwrap();
        again.close();
    }

    #[tokio::test]
    async fn test_session_relays_until_disconnect() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ctx = context(
            broker.local_addr().unwrap(),
            ProxyConfig::new("mqtt://127.0.0.1:1883", "public"),
        );

        let (proxy_side, client_side) = tokio::io::duplex(4096);
        let session = tokio::spawn(handle_client(Box::new(proxy_side), peer(), Arc::clone(&ctx)));
        let (client_read, mut client_out) = tokio::io::split(client_side);
        let mut client_in = FrameReader::new(client_read, 1024);

        client_out
            .write_all(&test_packets::connect("sensor-1"))
            .await
            .unwrap();

        let (socket, _) = broker.accept().await.unwrap();
        let (broker_read, mut broker_out) = socket.into_split();
        let mut broker_in = FrameReader::new(broker_read, 1024);
        let connect = broker_in.next_frame().await.unwrap().unwrap();
        assert_eq!(connect.as_bytes(), &test_packets::connect("sensor-1"));

        broker_out.write_all(&test_packets::connack(0)).await.unwrap();
        let connack = client_in.next_frame().await.unwrap().unwrap();
        assert_eq!(connack.as_bytes(), &test_packets::connack(0));

        client_out
            .write_all(&test_packets::publish_qos0("up", b"1"))
            .await
            .unwrap();
        let up = broker_in.next_frame().await.unwrap().unwrap();
        assert_eq!(up.as_bytes(), &test_packets::publish_qos0("up", b"1"));

        let down = test_packets::publish_qos1(7, "t1", b"2");
        broker_out.write_all(&down).await.unwrap();
        assert_eq!(client_in.next_frame().await.unwrap().unwrap().as_bytes(), &down);

        client_out.write_all(&test_packets::puback(7)).await.unwrap();
        client_out
            .write_all(&test_packets::disconnect())
            .await
            .unwrap();
        assert_eq!(
            broker_in.next_frame().await.unwrap().unwrap().as_bytes(),
            &test_packets::puback(7)
        );
        assert_eq!(
            broker_in.next_frame().await.unwrap().unwrap().as_bytes(),
            &test_packets::disconnect()
        );
        assert!(broker_in.next_frame().await.unwrap().is_none());

        session.await.unwrap();
        assert_eq!(ctx.metrics.sessions_total.get(), 1);
        assert_eq!(ctx.metrics.active_sessions.get(), 0);
        assert!(client_in.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_silent_broker_hits_handshake_timeout() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ProxyConfig::new("mqtt://127.0.0.1:1883", "public");
        config.broker_handshake_timeout_ms = 100;
        let ctx = context(broker.local_addr().unwrap(), config);

        let (proxy_side, client_side) = tokio::io::duplex(4096);
        let session = tokio::spawn(handle_client(Box::new(proxy_side), peer(), Arc::clone(&ctx)));
        let (client_read, mut client_out) = tokio::io::split(client_side);
        let mut client_in = FrameReader::new(client_read, 1024);

        client_out
            .write_all(&test_packets::connect("sensor-1"))
            .await
            .unwrap();
        // Accept but never answer
        let (_socket, _) = broker.accept().await.unwrap();

        let refusal = tokio::time::timeout(Duration::from_secs(5), client_in.next_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(refusal.as_bytes(), &test_packets::connack(3));
        assert!(client_in.next_frame().await.unwrap().is_none());

        session.await.unwrap();
        assert_eq!(ctx.metrics.broker_connect_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_client_loss_during_handshake_closes_broker_leg() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ProxyConfig::new("mqtt://127.0.0.1:1883", "public");
        config.broker_handshake_timeout_ms = 0;
        let ctx = context(broker.local_addr().unwrap(), config);

        let (proxy_side, mut client_side) = tokio::io::duplex(4096);
        let session = tokio::spawn(handle_client(Box::new(proxy_side), peer(), Arc::clone(&ctx)));

        client_side
            .write_all(&test_packets::connect("sensor-1"))
            .await
            .unwrap();
        let (socket, _) = broker.accept().await.unwrap();
        let mut broker_in = FrameReader::new(socket, 1024);
        let connect = broker_in.next_frame().await.unwrap().unwrap();
        assert_eq!(connect.as_bytes(), &test_packets::connect("sensor-1"));

        // The broker never answers; the client gives up
        drop(client_side);

        let eof = tokio::time::timeout(Duration::from_secs(3), broker_in.next_frame())
            .await
            .unwrap();
        assert!(matches!(eof, Ok(None)));
        tokio::time::timeout(Duration::from_secs(3), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.metrics.active_sessions.get(), 0);
    }

    #[tokio::test]
    async fn test_oversized_client_frame_ends_session() {
        let mut config = ProxyConfig::new("mqtt://127.0.0.1:1883", "public");
        config.common.max_frame_size = 16;
        let ctx = context("127.0.0.1:1".parse().unwrap(), config);

        let (proxy_side, mut client_side) = tokio::io::duplex(4096);
        let session = tokio::spawn(handle_client(Box::new(proxy_side), peer(), Arc::clone(&ctx)));

        client_side
            .write_all(&test_packets::publish_qos0("a/long/topic/name", b"payload"))
            .await
            .unwrap();
        session.await.unwrap();
        assert_eq!(ctx.metrics.active_sessions.get(), 0);
    }
}
