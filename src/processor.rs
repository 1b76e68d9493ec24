use async_trait::async_trait;
use mqttrs::{Connect, Packet, Publish};
use tracing::trace;

use crate::codec::{packet_name, Frame};
use crate::error::SessionError;

#[async_trait]
pub trait ProtocolMethodProcessor: Send {
    async fn process_connect(
        &mut self,
        connect: &Connect<'_>,
        frame: &Frame,
    ) -> Result<(), SessionError>;

    async fn process_publish(
        &mut self,
        publish: &Publish<'_>,
        frame: &Frame,
    ) -> Result<(), SessionError>;

    async fn process_pub_ack(&mut self, packet_id: u16, frame: &Frame)
        -> Result<(), SessionError>;

    async fn process_pub_rec(&mut self, packet_id: u16, frame: &Frame)
        -> Result<(), SessionError>;

    async fn process_pub_rel(&mut self, packet_id: u16, frame: &Frame)
        -> Result<(), SessionError>;

    async fn process_pub_comp(
        &mut self,
        packet_id: u16,
        frame: &Frame,
    ) -> Result<(), SessionError>;

    async fn process_subscribe(
        &mut self,
        packet_id: u16,
        frame: &Frame,
    ) -> Result<(), SessionError>;

    async fn process_unsubscribe(
        &mut self,
        packet_id: u16,
        frame: &Frame,
    ) -> Result<(), SessionError>;

    async fn process_ping_req(&mut self, frame: &Frame) -> Result<(), SessionError>;

    async fn process_disconnect(&mut self, frame: &Frame) -> Result<(), SessionError>;

    /// The client transport went away, cleanly or not.
    async fn process_connection_lost(&mut self);
}

/// Route one client frame to its handler.
///
/// Returns `Ok(false)` after a DISCONNECT, when the session should stop
/// reading. Packets only a server may send are rejected.
pub async fn dispatch<P>(processor: &mut P, frame: &Frame) -> Result<bool, SessionError>
where
    P: ProtocolMethodProcessor + ?Sized,
{
    let packet = frame.packet()?;
    trace!("Client sent {}", packet_name(&packet));

    match &packet {
        Packet::Connect(connect) => processor.process_connect(connect, frame).await?,
        Packet::Publish(publish) => processor.process_publish(publish, frame).await?,
        Packet::Puback(pid) => processor.process_pub_ack(pid.get(), frame).await?,
        Packet::Pubrec(pid) => processor.process_pub_rec(pid.get(), frame).await?,
        Packet::Pubrel(pid) => processor.process_pub_rel(pid.get(), frame).await?,
        Packet::Pubcomp(pid) => processor.process_pub_comp(pid.get(), frame).await?,
        Packet::Subscribe(subscribe) => {
            processor
                .process_subscribe(subscribe.pid.get(), frame)
                .await?
        }
        Packet::Unsubscribe(unsubscribe) => {
            processor
                .process_unsubscribe(unsubscribe.pid.get(), frame)
                .await?
        }
        Packet::Pingreq => processor.process_ping_req(frame).await?,
        Packet::Disconnect => {
            processor.process_disconnect(frame).await?;
            return Ok(false);
        }
        Packet::Connack(_) | Packet::Suback(_) | Packet::Unsuback(_) | Packet::Pingresp => {
            return Err(SessionError::Protocol(format!(
                "client sent server-only packet {}",
                packet_name(&packet)
            )));
        }
    }

    Ok(true)
}
