//! Optional mirroring of client requests to a broadcast endpoint (§4.8).
//!
//! Grounded on this codebase's `pubsub::ZmqPublisher`: a PUB socket, topic as
//! the first frame for subscriber-side prefix filtering. Unlike the broker's
//! other event bus this one carries raw frames, not a MessagePack envelope —
//! the broker has no serialization format of its own to impose on request
//! bodies it never inspects.

use tokio::sync::Mutex;
use zeromq::prelude::*;
use zeromq::{PubSocket, ZmqMessage};

use crate::error::BrokerError;
use crate::transport::Transport;

pub struct Publisher {
    socket: Mutex<PubSocket>,
}

impl Publisher {
    pub async fn bind(transport: &Transport) -> Result<Self, BrokerError> {
        transport.ensure_ipc_dir()?;
        transport.remove_stale_socket()?;
        let mut socket = PubSocket::new();
        socket.bind(&transport.endpoint()).await?;
        tracing::info!(endpoint = %transport, "publisher fan-out endpoint bound");
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Mirror a client request: `[service, envelope, body...]`.
    ///
    /// Best-effort — a send error is logged and swallowed so a stalled
    /// subscriber never blocks request dispatch.
    pub async fn mirror(&self, service: &str, envelope: &[u8], body: &[Vec<u8>]) {
        let mut msg = ZmqMessage::from(service.to_string());
        msg.push_back(envelope.to_vec().into());
        for frame in body {
            msg.push_back(frame.clone().into());
        }
        let mut socket = self.socket.lock().await;
        if let Err(e) = socket.send(msg).await {
            tracing::warn!(error = %e, service, "fan-out publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeromq::SubSocket;

    #[tokio::test]
    async fn mirrors_request_with_service_as_topic() {
        let transport = Transport::tcp("127.0.0.1", 17800);
        let publisher = Publisher::bind(&transport).await.unwrap();

        let mut sub = SubSocket::new();
        sub.connect(&transport.endpoint()).await.unwrap();
        sub.subscribe("echo").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        publisher
            .mirror("echo", b"client-1", &[b"hi".to_vec()])
            .await;

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        let frames: Vec<_> = received.iter().collect();
        assert_eq!(frames[0].as_ref(), b"echo");
        assert_eq!(frames[1].as_ref(), b"client-1");
        assert_eq!(frames[2].as_ref(), b"hi");
    }
}
