//! UDP transport to MQTT-SN clients

use super::ClientTransport;
use crate::protocol::{encode, CodecError, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::trace;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: CodecError,
    },
    #[error("Failed to send datagram to {peer}: {source}")]
    Send {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Sends to one client through the gateway's shared socket
#[derive(Debug, Clone)]
pub struct UdpClientTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpClientTransport {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait::async_trait]
impl ClientTransport for UdpClientTransport {
    type Error = TransportError;

    async fn send(&self, message: &Message) -> Result<(), Self::Error> {
        let datagram = encode(message).map_err(|source| TransportError::Encode {
            kind: message.name(),
            source,
        })?;
        self.socket
            .send_to(&datagram, self.peer)
            .await
            .map_err(|source| TransportError::Send {
                peer: self.peer,
                source,
            })?;
        trace!(peer = %self.peer, "Sent {} ({} bytes)", message.name(), datagram.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, Pubrel};

    #[tokio::test]
    async fn test_send_encodes_to_peer() {
        let gateway = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpClientTransport::new(gateway, client.local_addr().unwrap());

        let message = Message::Pubrel(Pubrel { msg_id: 7 });
        transport.send(&message).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(decode(&buf[..len]).unwrap(), message);
    }

    #[tokio::test]
    async fn test_unencodable_message_is_an_error() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = socket.local_addr().unwrap();
        let transport = UdpClientTransport::new(socket, peer);

        let result = transport.send(&Message::Other(0x12)).await;
        assert!(matches!(result, Err(TransportError::Encode { .. })));
    }
}
