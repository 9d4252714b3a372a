//! The Majordomo-style broker: dual-endpoint dispatch and liveness core.
//!
//! Structurally this follows this codebase's other broker (`EventBroker` in
//! the original tree): a config struct, an `Arc`-shared metrics handle, an
//! `AtomicBool`/`Notify` shutdown signal, and a `run()` that binds its
//! sockets, spawns the ambient metrics HTTP server, then loops on
//! `tokio::select!` until told to stop. What changed is the loop body: two
//! ROUTER endpoints instead of one SUB/PUB proxy pair, and the registry from
//! `registry.rs` driving FIFO dispatch instead of blind forwarding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;
use zeromq::prelude::*;
use zeromq::{RouterSocket, ZmqMessage};

pub use crate::config::BrokerConfig;
use crate::auth::Authenticator;
use crate::error::BrokerError;
use crate::fanout::Publisher;
use crate::metrics::{BrokerMetrics, ServiceMetrics};
use crate::mgmt;
use crate::protocol::{self, Channel, ClientFrame, WorkerFrame};
use crate::registry::{self, PendingRequest, Registry};

/// The broker's dispatch and liveness core.
pub struct Broker {
    config: BrokerConfig,
    metrics: BrokerMetrics,
    authenticator: Arc<Authenticator>,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Broker {
    /// Construct a broker that admits every peer on the encrypted endpoint.
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_authenticator(config, Arc::new(Authenticator::allow_any()))
    }

    /// Construct a broker with a caller-supplied authenticator, e.g. one
    /// built from a credentials directory or an injected callback.
    pub fn with_authenticator(config: BrokerConfig, authenticator: Arc<Authenticator>) -> Self {
        Self {
            config,
            metrics: BrokerMetrics::new(),
            authenticator,
            shutdown: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    /// Signal the broker to shut down gracefully after the current cycle.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Run the broker until `shutdown()` is called or a bind fails.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let plaintext_transport = self.config.plaintext_transport();
        let encrypted_transport = self.config.encrypted_transport();

        let mut plaintext = RouterSocket::new();
        plaintext_transport.ensure_ipc_dir()?;
        plaintext_transport.remove_stale_socket()?;
        plaintext.bind(&plaintext_transport.endpoint()).await?;
        tracing::info!(endpoint = %plaintext_transport, "plaintext endpoint bound");

        let mut encrypted = RouterSocket::new();
        encrypted_transport.ensure_ipc_dir()?;
        encrypted_transport.remove_stale_socket()?;
        encrypted.bind(&encrypted_transport.endpoint()).await?;
        tracing::info!(endpoint = %encrypted_transport, "encrypted endpoint bound");

        let publisher = match self.config.publisher_transport() {
            Some(t) => Some(Publisher::bind(&t).await?),
            None => None,
        };

        let (metrics_shutdown_tx, metrics_shutdown_rx) = tokio::sync::watch::channel(false);
        let _metrics_handle = self.config.metrics_port.map(|port| {
            crate::metrics::spawn_metrics_server(port, self.metrics.clone(), metrics_shutdown_rx)
        });

        let mut registry = Registry::new();
        let heartbeat_interval = self.config.heartbeat_interval();
        let liveness = self.config.heartbeat_liveness;
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // first tick fires immediately; skip it

        tracing::info!("broker dispatch loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                result = plaintext.recv() => {
                    match result {
                        Ok(msg) => {
                            self.handle_inbound(
                                &mut registry,
                                &mut plaintext,
                                &mut encrypted,
                                Channel::Plaintext,
                                msg,
                                publisher.as_ref(),
                            ).await;
                        }
                        Err(e) => tracing::warn!(error = %e, "plaintext recv error"),
                    }
                }
                result = encrypted.recv() => {
                    match result {
                        Ok(msg) => {
                            let identity = msg.iter().next().map(|f| f.to_vec()).unwrap_or_default();
                            if self.authenticator.authorize(&identity).await {
                                self.handle_inbound(
                                    &mut registry,
                                    &mut plaintext,
                                    &mut encrypted,
                                    Channel::Encrypted,
                                    msg,
                                    publisher.as_ref(),
                                ).await;
                            } else {
                                tracing::warn!(identity = %String::from_utf8_lossy(&identity), "rejected by authenticator");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "encrypted recv error"),
                    }
                }
                _ = ticker.tick() => {
                    self.heartbeat_tick(&mut registry, &mut plaintext, &mut encrypted, liveness).await;
                }
                _ = self.notify.notified() => {
                    break;
                }
            }
        }

        tracing::info!("broker shutting down, disconnecting workers");
        for worker in registry.known_workers() {
            let origin = registry.worker(&worker).map(|w| w.origin);
            let msg = protocol::build_worker_disconnect(&worker);
            let socket = match origin {
                Some(Channel::Encrypted) => &mut encrypted,
                _ => &mut plaintext,
            };
            if let Err(e) = socket.send(msg).await {
                tracing::warn!(error = %e, "failed to send shutdown DISCONNECT");
            }
        }

        let _ = metrics_shutdown_tx.send(true);
        tracing::info!("broker stopped");
        Ok(())
    }

    async fn handle_inbound(
        &self,
        registry: &mut Registry,
        plaintext: &mut RouterSocket,
        encrypted: &mut RouterSocket,
        channel: Channel,
        msg: ZmqMessage,
        publisher: Option<&Publisher>,
    ) {
        let frames: Vec<bytes::Bytes> = msg.iter().cloned().collect();
        let Some((identity, rest)) = frames.split_first() else {
            return;
        };
        let identity = identity.to_vec();

        if let Ok(client) = protocol::decode_client_frame(rest) {
            self.handle_client_frame(registry, plaintext, encrypted, channel, identity, client, publisher)
                .await;
            return;
        }
        if let Ok(worker) = protocol::decode_worker_frame(rest) {
            self.handle_worker_frame(registry, plaintext, encrypted, channel, identity, worker)
                .await;
            return;
        }

        self.metrics.record_protocol_violation();
        tracing::warn!(identity = %String::from_utf8_lossy(&identity), "unrecognized frame, dropping");
        if let Some(entry) = registry.delete_worker(&identity) {
            self.send_disconnect(plaintext, encrypted, entry.origin, &identity).await;
        }
    }

    async fn handle_client_frame(
        &self,
        registry: &mut Registry,
        plaintext: &mut RouterSocket,
        encrypted: &mut RouterSocket,
        channel: Channel,
        identity: Vec<u8>,
        frame: ClientFrame,
        publisher: Option<&Publisher>,
    ) {
        let ClientFrame::Request { service, body } = frame;

        if mgmt::is_management_service(&service) {
            let reply_body = mgmt::handle(registry, &service, &body);
            let reply = protocol::build_client_reply(&identity, &service, &[reply_body]);
            let socket = Self::socket_for(channel, plaintext, encrypted);
            if let Err(e) = socket.send(reply).await {
                tracing::warn!(error = %e, "failed to send management reply");
            }
            return;
        }

        if let Some(publisher) = publisher {
            publisher.mirror(&service, &identity, &body).await;
        }

        let enqueued = registry.enqueue_request(
            &service,
            PendingRequest {
                envelope: identity,
                body,
                origin: channel,
            },
        );
        if !enqueued {
            tracing::debug!(service = %service, "request for unknown service dropped");
            return;
        }

        self.run_dispatch(registry, plaintext, encrypted, &service).await;
    }

    async fn handle_worker_frame(
        &self,
        registry: &mut Registry,
        plaintext: &mut RouterSocket,
        encrypted: &mut RouterSocket,
        channel: Channel,
        identity: Vec<u8>,
        frame: WorkerFrame,
    ) {
        let expiry = registry::expiry_at(Instant::now(), self.config.heartbeat_interval(), self.config.heartbeat_liveness);

        match frame {
            WorkerFrame::Ready { service } => {
                // READY is only valid as the first command on a session; a
                // worker already in the registry re-sending it is a protocol
                // violation (§4.4), same as naming a management service.
                if mgmt::is_management_service(&service) || registry.worker(&identity).is_some() {
                    self.metrics.record_protocol_violation();
                    registry.delete_worker(&identity);
                    self.send_disconnect(plaintext, encrypted, channel, &identity).await;
                    return;
                }
                registry.ready(identity, &service, channel, expiry);
                self.run_dispatch(registry, plaintext, encrypted, &service).await;
            }
            WorkerFrame::Reply { envelope, body } => {
                self.handle_reply(registry, plaintext, encrypted, channel, &identity, Channel::Plaintext, envelope, body, expiry).await;
            }
            WorkerFrame::ReplyViaEncrypted { envelope, body } => {
                self.handle_reply(registry, plaintext, encrypted, channel, &identity, Channel::Encrypted, envelope, body, expiry).await;
            }
            WorkerFrame::Heartbeat => {
                if !registry.renew_heartbeat(&identity, expiry) {
                    self.send_disconnect(plaintext, encrypted, channel, &identity).await;
                }
            }
            WorkerFrame::Disconnect => {
                registry.delete_worker(&identity);
            }
        }
    }

    /// Handle a REPLY/REPLY-VIA-ENCRYPTED from a worker: `reply_channel` is
    /// the endpoint the original client request arrived on (encoded in the
    /// command byte), not necessarily the worker's own `channel`.
    #[allow(clippy::too_many_arguments)]
    async fn handle_reply(
        &self,
        registry: &mut Registry,
        plaintext: &mut RouterSocket,
        encrypted: &mut RouterSocket,
        worker_channel: Channel,
        identity: &[u8],
        reply_channel: Channel,
        envelope: Vec<u8>,
        body: Vec<Vec<u8>>,
        expiry: Instant,
    ) {
        let Some(service) = registry.worker(identity).map(|w| w.service.clone()) else {
            self.metrics.record_protocol_violation();
            self.send_disconnect(plaintext, encrypted, worker_channel, identity).await;
            return;
        };
        registry.worker_to_waiting(identity, expiry);

        let reply = protocol::build_client_reply(&envelope, &service, &body);
        let socket = Self::socket_for(reply_channel, plaintext, encrypted);
        if let Err(e) = socket.send(reply).await {
            tracing::warn!(error = %e, "failed to send reply to client");
        }

        self.run_dispatch(registry, plaintext, encrypted, &service).await;
    }

    async fn run_dispatch(
        &self,
        registry: &mut Registry,
        plaintext: &mut RouterSocket,
        encrypted: &mut RouterSocket,
        service: &str,
    ) {
        registry.purge_expired(Instant::now());
        for dispatch in registry.dispatch(service) {
            self.metrics.record_dispatch();
            let worker_origin = registry.worker(&dispatch.worker).map(|w| w.origin).unwrap_or(Channel::Plaintext);
            let msg = protocol::build_worker_request(
                &dispatch.worker,
                dispatch.request.origin,
                &dispatch.request.envelope,
                &dispatch.request.body,
            );
            let socket = Self::socket_for(worker_origin, plaintext, encrypted);
            if let Err(e) = socket.send(msg).await {
                tracing::warn!(error = %e, "failed to dispatch request to worker");
            }
        }
    }

    async fn heartbeat_tick(
        &self,
        registry: &mut Registry,
        plaintext: &mut RouterSocket,
        encrypted: &mut RouterSocket,
        _liveness: u32,
    ) {
        let now = Instant::now();
        let purged = registry.purge_expired(now);
        if !purged.is_empty() {
            self.metrics.record_workers_purged(purged.len() as u64);
            tracing::info!(count = purged.len(), "purged expired workers");
        }

        if let Err(e) = self.authenticator.reconcile().await {
            tracing::warn!(error = %e, "credential directory reconcile failed");
        }

        let waiting: Vec<_> = registry.global_waiting().iter().cloned().collect();
        for worker in waiting {
            let origin = registry.worker(&worker).map(|w| w.origin).unwrap_or(Channel::Plaintext);
            let msg = protocol::build_worker_heartbeat(&worker);
            let socket = Self::socket_for(origin, plaintext, encrypted);
            if socket.send(msg).await.is_ok() {
                self.metrics.record_heartbeat_sent();
            }
        }

        let mut snapshot = std::collections::HashMap::new();
        for service in registry.known_services() {
            if let Some(entry) = registry.lookup_service(&service) {
                snapshot.insert(
                    service,
                    ServiceMetrics {
                        queue_depth: entry.requests.len(),
                        idle_workers: entry.waiting.len(),
                    },
                );
            }
        }
        self.metrics.update_services(snapshot).await;
    }

    async fn send_disconnect(
        &self,
        plaintext: &mut RouterSocket,
        encrypted: &mut RouterSocket,
        channel: Channel,
        identity: &[u8],
    ) {
        let msg = protocol::build_worker_disconnect(identity);
        let socket = Self::socket_for(channel, plaintext, encrypted);
        let _ = socket.send(msg).await;
    }

    fn socket_for<'a>(
        channel: Channel,
        plaintext: &'a mut RouterSocket,
        encrypted: &'a mut RouterSocket,
    ) -> &'a mut RouterSocket {
        match channel {
            Channel::Plaintext => plaintext,
            Channel::Encrypted => encrypted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config_default_endpoints_differ() {
        let cfg = BrokerConfig::default();
        assert_ne!(cfg.plaintext_endpoint, cfg.encrypted_endpoint);
    }
}
