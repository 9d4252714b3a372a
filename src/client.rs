//! Conformance-level MDP client peer.
//!
//! Grounded on `reqrep.rs`'s `ZmqRequestClient`, but the Majordomo client
//! side has no correlation-id matching to do: one DEALER socket, one request
//! in flight at a time, and the recovery mechanism for a stuck or dead
//! broker connection is simply to close the socket and reconnect rather than
//! track individual requests, per the "send, await, retry" discipline the
//! distilled spec calls for the client to implement.

use std::time::Duration;

use tracing::{debug, info, warn};
use zeromq::prelude::*;
use zeromq::{DealerSocket, ZmqMessage};

use crate::error::BrokerError;
use crate::protocol::CLIENT_HEADER;
use crate::transport::Transport;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);
const DEFAULT_RETRIES: u32 = 3;

/// A connected client peer, good for one request at a time.
pub struct MdpClient {
    transport: Transport,
    socket: DealerSocket,
    timeout: Duration,
    retries: u32,
}

impl MdpClient {
    /// Connect a DEALER socket to the broker's plaintext or encrypted
    /// endpoint.
    pub async fn connect(transport: Transport) -> Result<Self, BrokerError> {
        let socket = Self::dial(&transport).await?;
        Ok(Self {
            transport,
            socket,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        })
    }

    /// Override the per-attempt timeout (default 2500ms).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the number of attempts before giving up (default 3).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    async fn dial(transport: &Transport) -> Result<DealerSocket, BrokerError> {
        let mut socket = DealerSocket::new();
        socket.connect(&transport.endpoint()).await?;
        Ok(socket)
    }

    /// Send a request to `service` and wait for the matching reply,
    /// reconnecting and retrying up to `retries` times on timeout.
    ///
    /// Returns `BrokerError::Timeout` once every attempt has been exhausted.
    pub async fn request(
        &mut self,
        service: &str,
        body: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, BrokerError> {
        for attempt in 1..=self.retries {
            self.send_request(service, &body).await?;
            match tokio::time::timeout(self.timeout, self.socket.recv()).await {
                Ok(Ok(msg)) => {
                    if let Some(reply) = decode_reply(msg) {
                        return Ok(reply);
                    }
                    debug!(service, attempt, "ignoring malformed reply, retrying");
                }
                Ok(Err(e)) => {
                    warn!(error = %e, service, attempt, "recv error, reconnecting");
                }
                Err(_) => {
                    warn!(service, attempt, timeout_ms = self.timeout.as_millis() as u64, "request timed out, reconnecting");
                }
            }
            self.socket = Self::dial(&self.transport).await?;
        }
        Err(BrokerError::Timeout(self.timeout))
    }

    async fn send_request(&mut self, service: &str, body: &[Vec<u8>]) -> Result<(), BrokerError> {
        let mut msg = ZmqMessage::from(Vec::<u8>::new());
        msg.push_back(CLIENT_HEADER.to_vec().into());
        msg.push_back(service.as_bytes().to_vec().into());
        for frame in body {
            msg.push_back(frame.clone().into());
        }
        self.socket.send(msg).await?;
        info!(service, "request sent");
        Ok(())
    }
}

/// Decode a `[] [CLIENT_HEADER] [service] [reply...]` message from the
/// broker. Returns `None` for anything that isn't a well-formed reply.
fn decode_reply(msg: ZmqMessage) -> Option<Vec<Vec<u8>>> {
    let frames: Vec<_> = msg.iter().collect();
    let start = frames.iter().position(|f| !f.is_empty())?;
    let rest = &frames[start..];
    let (header, rest) = rest.split_first()?;
    if header.as_ref() != CLIENT_HEADER {
        return None;
    }
    let (_service, body) = rest.split_first()?;
    Some(body.iter().map(|f| f.to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeromq::RouterSocket;

    async fn bind_router(port: u16) -> (RouterSocket, Transport) {
        let transport = Transport::tcp("127.0.0.1", port);
        let mut router = RouterSocket::new();
        router.bind(&transport.endpoint()).await.unwrap();
        (router, transport)
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let (mut router, transport) = bind_router(18910).await;
        let mut client = MdpClient::connect(transport).await.unwrap();

        let server = tokio::spawn(async move {
            let msg = router.recv().await.unwrap();
            let frames: Vec<_> = msg.iter().collect();
            let identity = frames[0].to_vec();
            let mut reply = ZmqMessage::from(identity);
            reply.push_back(Vec::new().into());
            reply.push_back(CLIENT_HEADER.to_vec().into());
            reply.push_back(b"echo".to_vec().into());
            reply.push_back(b"HI".to_vec().into());
            router.send(reply).await.unwrap();
        });

        let reply = client
            .request("echo", vec![b"hi".to_vec()])
            .await
            .unwrap();
        assert_eq!(reply, vec![b"HI".to_vec()]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn request_times_out_when_broker_never_replies() {
        let (_router, transport) = bind_router(18911).await;
        let mut client = MdpClient::connect(transport)
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(50))
            .with_retries(2);

        let err = client.request("echo", vec![b"hi".to_vec()]).await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
    }

    #[test]
    fn decode_reply_rejects_bad_header() {
        let mut msg = ZmqMessage::from(Vec::<u8>::new());
        msg.push_back(b"bogus".to_vec().into());
        assert!(decode_reply(msg).is_none());
    }
}
