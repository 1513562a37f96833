//! Local datagram transport between the producer and translator stages.
//!
//! [`UdpUplink`] frames samples with the [`wire`][crate::wire] layout and
//! sends them to a fixed target; [`UdpIngress`] binds the receiving side and
//! decodes what arrives. Both own their socket, which is closed when the value
//! is dropped, whichever way the owning task exits.

use std::net::SocketAddr;

use aegis_types::GatewayError;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::wire::{MAX_PACKET_LEN, WirePacket};

/// Sending half: one connected UDP socket.
#[derive(Debug)]
pub struct UdpUplink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpUplink {
    /// Bind an ephemeral local port and connect it to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the socket cannot be bound or
    /// connected.
    pub async fn connect(target: SocketAddr) -> Result<Self, GatewayError> {
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| GatewayError::Transport(format!("uplink bind error: {e}")))?;
        socket
            .connect(target)
            .await
            .map_err(|e| GatewayError::Transport(format!("uplink connect to {target}: {e}")))?;
        debug!(target = %target, "udp uplink ready");
        Ok(Self { socket, target })
    }

    /// Encode and send one packet. Returns the number of bytes written.
    pub async fn send(&self, packet: &WirePacket) -> Result<usize, GatewayError> {
        let bytes = packet.encode()?;
        self.socket
            .send(&bytes)
            .await
            .map_err(|e| GatewayError::Transport(format!("uplink send to {}: {e}", self.target)))
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

/// Receiving half: one bound UDP socket.
#[derive(Debug)]
pub struct UdpIngress {
    socket: UdpSocket,
}

impl UdpIngress {
    /// Bind `addr`. Use port `0` to let the OS pick one and read it back with
    /// [`local_addr`][Self::local_addr].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, GatewayError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("ingress bind error on {addr}: {e}")))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        self.socket
            .local_addr()
            .map_err(|e| GatewayError::Transport(format!("ingress local_addr: {e}")))
    }

    /// Wait for the next datagram and decode it.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Transport`] on socket errors, [`GatewayError::Codec`]
    /// for malformed datagrams. Both are recoverable; the caller should log
    /// and keep receiving.
    pub async fn recv(&self) -> Result<(WirePacket, SocketAddr), GatewayError> {
        // One spare byte so oversized datagrams are detected, not truncated.
        let mut buf = [0u8; MAX_PACKET_LEN + 1];
        let (len, peer) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| GatewayError::Transport(format!("ingress recv error: {e}")))?;
        let packet = WirePacket::decode(&buf[..len])?;
        Ok((packet, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::Sample;
    use std::time::Duration;

    #[tokio::test]
    async fn uplink_to_ingress_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let ingress = UdpIngress::bind("127.0.0.1:0".parse()?).await?;
        let uplink = UdpUplink::connect(ingress.local_addr()?).await?;

        let sample = Sample::new(42, 0, 123_456);
        uplink.send(&WirePacket::from(sample)).await?;

        let (packet, _peer) = tokio::time::timeout(Duration::from_secs(2), ingress.recv()).await??;
        assert_eq!(packet.to_sample(), sample);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_datagram_is_a_codec_error() -> Result<(), Box<dyn std::error::Error>> {
        let ingress = UdpIngress::bind("127.0.0.1:0".parse()?).await?;
        let raw = UdpSocket::bind("127.0.0.1:0").await?;
        raw.send_to(&[1, 2, 3], ingress.local_addr()?).await?;

        let result = tokio::time::timeout(Duration::from_secs(2), ingress.recv()).await?;
        assert!(matches!(result, Err(GatewayError::Codec(_))));
        Ok(())
    }

    #[tokio::test]
    async fn binding_a_taken_port_fails() -> Result<(), Box<dyn std::error::Error>> {
        let first = UdpIngress::bind("127.0.0.1:0".parse()?).await?;
        let err = UdpIngress::bind(first.local_addr()?).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        Ok(())
    }
}
