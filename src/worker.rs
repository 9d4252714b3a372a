//! Conformance-level MDP worker peer.
//!
//! Grounded on `reqrep.rs`'s `ZmqRequestClient`: a DEALER socket driven by a
//! single `tokio::select!` loop so sends (replies, heartbeats) and receives
//! (requests, heartbeats, disconnects) never contend over the same socket.
//! The builder/handler shape is carried over from this codebase's original
//! `WorkerBuilder`, retargeted from generic pub/sub health pings to the
//! request/reply handler a service worker needs.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};
use zeromq::prelude::*;
use zeromq::{DealerSocket, ZmqMessage};

use crate::error::BrokerError;
use crate::protocol::{Channel, Command, WORKER_HEADER};
use crate::transport::Transport;

/// Boxed async handler for one incoming request body, returning the reply
/// body frames.
pub type RequestHandler = Box<
    dyn Fn(Vec<Vec<u8>>) -> Pin<Box<dyn Future<Output = Vec<Vec<u8>>> + Send>> + Send + Sync,
>;

/// Fluent builder for a [`MdpWorker`].
///
/// # Example
/// ```ignore
/// let worker = WorkerBuilder::new("echo")
///     .heartbeat_interval(Duration::from_millis(2500))
///     .liveness(3)
///     .on_request(|body| Box::pin(async move { body }))
///     .connect(&transport)
///     .await?;
/// ```
pub struct WorkerBuilder {
    service: String,
    heartbeat_interval: Duration,
    liveness: u32,
    handler: Option<RequestHandler>,
}

impl WorkerBuilder {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            heartbeat_interval: Duration::from_millis(2500),
            liveness: 3,
            handler: None,
        }
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn liveness(mut self, liveness: u32) -> Self {
        self.liveness = liveness;
        self
    }

    /// Register the handler invoked for each REQUEST body.
    pub fn on_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<Vec<u8>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<Vec<u8>>> + Send + 'static,
    {
        self.handler = Some(Box::new(move |body| Box::pin(handler(body))));
        self
    }

    /// Connect to the broker on the given endpoint and send READY.
    ///
    /// Which endpoint this dials (plaintext or encrypted) is a property of
    /// `transport`, not of the worker: a single worker process only ever
    /// needs one connection, and every reply it sends echoes back whichever
    /// REQUEST/REQUEST-VIA-ENCRYPTED variant that particular request arrived
    /// as (see [`MdpWorker::send_reply`]), so there is nothing left for this
    /// method to pin down ahead of time.
    pub async fn connect(self, transport: &Transport) -> Result<MdpWorker, BrokerError> {
        let handler = self.handler.ok_or_else(|| {
            BrokerError::Protocol("worker built without on_request handler".into())
        })?;

        let mut socket = DealerSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, service = %self.service, "worker connecting");
        socket.connect(&endpoint).await?;

        let mut worker = MdpWorker {
            socket,
            service: self.service,
            heartbeat_interval: self.heartbeat_interval,
            liveness: self.liveness,
            handler,
        };
        worker.send_ready().await?;
        Ok(worker)
    }
}

/// A connected worker, ready to serve requests via [`MdpWorker::run`].
pub struct MdpWorker {
    socket: DealerSocket,
    service: String,
    heartbeat_interval: Duration,
    liveness: u32,
    handler: RequestHandler,
}

impl MdpWorker {
    async fn send_ready(&mut self) -> Result<(), BrokerError> {
        let mut msg = ZmqMessage::from(Vec::<u8>::new());
        msg.push_back(WORKER_HEADER.to_vec().into());
        msg.push_back(vec![Command::Ready.as_byte()].into());
        msg.push_back(self.service.as_bytes().to_vec().into());
        self.socket.send(msg).await?;
        debug!(service = %self.service, "sent READY");
        Ok(())
    }

    async fn send_heartbeat(&mut self) -> Result<(), BrokerError> {
        let mut msg = ZmqMessage::from(Vec::<u8>::new());
        msg.push_back(WORKER_HEADER.to_vec().into());
        msg.push_back(vec![Command::Heartbeat.as_byte()].into());
        self.socket.send(msg).await?;
        Ok(())
    }

    /// `reply_channel` is the channel the *inbound* REQUEST was tagged with
    /// (REQUEST vs REQUEST-VIA-ENCRYPTED), not this worker's own connection
    /// channel — the broker picks which endpoint to egress the reply on by
    /// the command byte alone, so the reply must echo it back verbatim
    /// (§4.4, §4.6).
    async fn send_reply(
        &mut self,
        reply_channel: Channel,
        envelope: &[u8],
        body: Vec<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        let mut msg = ZmqMessage::from(Vec::<u8>::new());
        msg.push_back(WORKER_HEADER.to_vec().into());
        msg.push_back(vec![reply_channel.reply_command().as_byte()].into());
        msg.push_back(envelope.to_vec().into());
        msg.push_back(Vec::new().into());
        for frame in body {
            msg.push_back(frame.into());
        }
        self.socket.send(msg).await?;
        Ok(())
    }

    /// Serve requests until the broker sends DISCONNECT, the liveness
    /// deadline elapses with no traffic from the broker, or `shutdown` fires.
    pub async fn run(mut self, shutdown: &tokio::sync::Notify) -> Result<(), BrokerError> {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                result = self.socket.recv() => {
                    match result {
                        Ok(msg) => {
                            missed = 0;
                            if self.handle_inbound(msg).await? {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "worker recv error");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    missed += 1;
                    if missed > self.liveness {
                        warn!(service = %self.service, "broker liveness exceeded, stopping");
                        break;
                    }
                    self.send_heartbeat().await?;
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }

        info!(service = %self.service, "worker stopped");
        Ok(())
    }

    /// Handle one inbound frame from the broker. Returns `true` if the
    /// worker should stop (DISCONNECT received).
    async fn handle_inbound(&mut self, msg: ZmqMessage) -> Result<bool, BrokerError> {
        let frames: Vec<_> = msg.iter().collect();
        let Some(start) = frames.iter().position(|f| !f.is_empty()) else {
            return Ok(false);
        };
        let rest = &frames[start..];
        let Some((header, rest)) = rest.split_first() else {
            return Ok(false);
        };
        if header.as_ref() != WORKER_HEADER {
            return Ok(false);
        }
        let Some((cmd_byte, rest)) = rest.split_first() else {
            return Ok(false);
        };
        if cmd_byte.len() != 1 {
            return Ok(false);
        }
        let Some(command) = Command::from_byte(cmd_byte[0]) else {
            return Ok(false);
        };

        match command {
            Command::Request | Command::RequestViaEncrypted => {
                let reply_channel = if command == Command::Request {
                    Channel::Plaintext
                } else {
                    Channel::Encrypted
                };
                let Some(envelope) = rest.first() else {
                    return Ok(false);
                };
                let envelope = envelope.to_vec();
                let body: Vec<Vec<u8>> = rest
                    .iter()
                    .skip(1)
                    .skip_while(|f| f.is_empty())
                    .map(|f| f.to_vec())
                    .collect();
                let reply = (self.handler)(body).await;
                self.send_reply(reply_channel, &envelope, reply).await?;
                Ok(false)
            }
            Command::Heartbeat => Ok(false),
            Command::Disconnect => Ok(true),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = WorkerBuilder::new("echo");
        assert_eq!(builder.service, "echo");
        assert_eq!(builder.heartbeat_interval, Duration::from_millis(2500));
        assert_eq!(builder.liveness, 3);
        assert!(builder.handler.is_none());
    }

    #[test]
    fn builder_fluent_api() {
        let builder = WorkerBuilder::new("echo")
            .heartbeat_interval(Duration::from_millis(500))
            .liveness(5)
            .on_request(|body| async move { body });
        assert_eq!(builder.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(builder.liveness, 5);
        assert!(builder.handler.is_some());
    }

    #[tokio::test]
    async fn connect_without_handler_is_rejected() {
        let transport = Transport::tcp("127.0.0.1", 18900);
        let err = WorkerBuilder::new("echo")
            .connect(&transport)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(_)));
    }

    fn request_frame(command: Command, envelope: &[u8], body: &[u8]) -> ZmqMessage {
        let mut msg = ZmqMessage::from(Vec::<u8>::new());
        msg.push_back(WORKER_HEADER.to_vec().into());
        msg.push_back(vec![command.as_byte()].into());
        msg.push_back(envelope.to_vec().into());
        msg.push_back(Vec::new().into());
        msg.push_back(body.to_vec().into());
        msg
    }

    #[tokio::test]
    async fn request_via_encrypted_picks_matching_reply_command() {
        let transport = Transport::tcp("127.0.0.1", 18901);
        let mut router = zeromq::RouterSocket::new();
        router.bind(&transport.endpoint()).await.unwrap();

        let mut worker = WorkerBuilder::new("echo")
            .on_request(|body| async move { body })
            .connect(&transport)
            .await
            .unwrap();
        let _ready = router.recv().await.unwrap();

        worker
            .handle_inbound(request_frame(Command::RequestViaEncrypted, b"c1", b"hi"))
            .await
            .unwrap();
        let reply = router.recv().await.unwrap();
        let frames: Vec<_> = reply.iter().collect();
        let start = frames.iter().position(|f| !f.is_empty()).unwrap();
        assert_eq!(
            frames[start + 1].to_vec(),
            vec![Command::ReplyViaEncrypted.as_byte()]
        );
    }

    #[tokio::test]
    async fn plain_request_picks_plaintext_reply_command() {
        let transport = Transport::tcp("127.0.0.1", 18902);
        let mut router = zeromq::RouterSocket::new();
        router.bind(&transport.endpoint()).await.unwrap();

        let mut worker = WorkerBuilder::new("echo")
            .on_request(|body| async move { body })
            .connect(&transport)
            .await
            .unwrap();
        let _ready = router.recv().await.unwrap();

        worker
            .handle_inbound(request_frame(Command::Request, b"c1", b"hi"))
            .await
            .unwrap();
        let reply = router.recv().await.unwrap();
        let frames: Vec<_> = reply.iter().collect();
        let start = frames.iter().position(|f| !f.is_empty()).unwrap();
        assert_eq!(frames[start + 1].to_vec(), vec![Command::Reply.as_byte()]);
    }
}
