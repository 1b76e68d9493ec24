#![allow(dead_code)]

use mqtt_redirect_proxy::codec::FrameReader;
use mqtt_redirect_proxy::ProxyConfig;
use mqttrs::{
    encode_slice, Connack, Connect, ConnectReturnCode, Packet, Pid, Protocol, Publish, QoS,
    QosPid, Suback, Subscribe, SubscribeReturnCodes, SubscribeTopic,
};
use std::net::SocketAddr;
use tokio::io::AsyncRead;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

pub type Reader = FrameReader<OwnedReadHalf>;

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Plain-only proxy on loopback that routes every client to `broker`.
pub fn proxy_config(broker: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::new(format!("mqtt://{}", broker), "public");
    config.bind_address = "127.0.0.1".to_string();
    config.mqtt_proxy_port = free_port();
    config.num_io_threads = 2;
    config.shutdown_timeout_ms = 300;
    config
}

pub struct FakeBroker {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl FakeBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    pub async fn accept(&self) -> (Reader, OwnedWriteHalf) {
        let (socket, _) = self.listener.accept().await.unwrap();
        let (read, write) = socket.into_split();
        (FrameReader::new(read, 64 * 1024), write)
    }
}

pub async fn connect_client(addr: SocketAddr) -> (Reader, OwnedWriteHalf) {
    let socket = TcpStream::connect(addr).await.unwrap();
    let (read, write) = socket.into_split();
    (FrameReader::new(read, 64 * 1024), write)
}

pub fn encode(packet: &Packet<'_>) -> Vec<u8> {
    let mut buf = vec![0u8; 1024];
    let len = encode_slice(packet, &mut buf).unwrap();
    buf.truncate(len);
    buf
}

fn pid(value: u16) -> Pid {
    Pid::try_from(value).unwrap()
}

pub fn connect(client_id: &str) -> Vec<u8> {
    encode(&Packet::Connect(Connect {
        protocol: Protocol::MQTT311,
        keep_alive: 60,
        client_id,
        clean_session: true,
        last_will: None,
        username: None,
        password: None,
    }))
}

pub fn connack(code: ConnectReturnCode) -> Vec<u8> {
    encode(&Packet::Connack(Connack {
        session_present: false,
        code,
    }))
}

pub fn publish_qos1(packet_id: u16, topic: &str, payload: &[u8]) -> Vec<u8> {
    encode(&Packet::Publish(Publish {
        dup: false,
        qospid: QosPid::AtLeastOnce(pid(packet_id)),
        retain: false,
        topic_name: topic,
        payload,
    }))
}

pub fn subscribe(packet_id: u16, topic: &str) -> Vec<u8> {
    encode(&Packet::Subscribe(Subscribe {
        pid: pid(packet_id),
        topics: vec![SubscribeTopic {
            topic_path: topic.to_string(),
            qos: QoS::AtLeastOnce,
        }],
    }))
}

pub fn suback(packet_id: u16) -> Vec<u8> {
    encode(&Packet::Suback(Suback {
        pid: pid(packet_id),
        return_codes: vec![SubscribeReturnCodes::Success(QoS::AtLeastOnce)],
    }))
}

pub fn puback(packet_id: u16) -> Vec<u8> {
    encode(&Packet::Puback(pid(packet_id)))
}

pub fn pingreq() -> Vec<u8> {
    encode(&Packet::Pingreq)
}

pub fn pingresp() -> Vec<u8> {
    encode(&Packet::Pingresp)
}

/// Next frame's bytes, or `None` once the peer has gone away.
pub async fn next_bytes<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Option<Vec<u8>> {
    match reader.next_frame().await {
        Ok(Some(frame)) => Some(frame.as_bytes().to_vec()),
        _ => None,
    }
}
