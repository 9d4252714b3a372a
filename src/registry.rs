//! Pure service/worker registry and dispatch logic.
//!
//! Deliberately free of any socket or clock I/O (the broker supplies `now`
//! explicitly) so the FIFO and liveness invariants can be unit tested without
//! standing up a single ZeroMQ socket — the same separation this codebase
//! already draws between `config::topological_sort` (pure) and the config
//! loader that calls it (I/O).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::protocol::Channel;

pub type WorkerId = Vec<u8>;
pub type ServiceName = String;

/// A client request captured verbatim, awaiting a worker.
pub struct PendingRequest {
    /// The client's routing envelope (its identity frame).
    pub envelope: Vec<u8>,
    /// Opaque request body frames.
    pub body: Vec<Vec<u8>>,
    /// Which endpoint the reply must ultimately egress on.
    pub origin: Channel,
}

/// A registered worker.
pub struct WorkerEntry {
    pub service: ServiceName,
    pub origin: Channel,
    pub expiry: Instant,
}

#[derive(Default)]
pub struct ServiceEntry {
    pub requests: VecDeque<PendingRequest>,
    pub waiting: VecDeque<WorkerId>,
}

/// A request matched to a worker, ready for the broker to send on the wire.
pub struct Dispatch {
    pub worker: WorkerId,
    pub request: PendingRequest,
}

/// The broker's in-memory registry of services and workers.
///
/// All mutation happens through these methods so the three structures
/// (service map, worker map, global waiting order) can never diverge —
/// the invariant this module exists to protect.
#[derive(Default)]
pub struct Registry {
    services: HashMap<ServiceName, ServiceEntry>,
    workers: HashMap<WorkerId, WorkerEntry>,
    global_waiting: VecDeque<WorkerId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the service entry, creating it if this is the first time it's
    /// been referenced (by a client request or a worker READY).
    pub fn require_service(&mut self, name: &str) -> &mut ServiceEntry {
        self.services.entry(name.to_string()).or_default()
    }

    /// Return the service entry only if it already exists.
    pub fn lookup_service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn known_services(&self) -> Vec<ServiceName> {
        self.services.keys().cloned().collect()
    }

    pub fn known_workers(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }

    pub fn worker(&self, id: &[u8]) -> Option<&WorkerEntry> {
        self.workers.get(id)
    }

    /// Enqueue a request for a known service. No-op (request dropped) if the
    /// service has never been registered by any worker.
    pub fn enqueue_request(&mut self, service: &str, request: PendingRequest) -> bool {
        match self.services.get_mut(service) {
            Some(entry) => {
                entry.requests.push_back(request);
                true
            }
            None => false,
        }
    }

    /// Attach a worker to a service after a successful READY, marking it
    /// waiting immediately.
    pub fn ready(&mut self, id: WorkerId, service: &str, origin: Channel, expiry: Instant) {
        self.workers.insert(
            id.clone(),
            WorkerEntry {
                service: service.to_string(),
                origin,
                expiry,
            },
        );
        self.require_service(service).waiting.push_back(id.clone());
        self.global_waiting.push_back(id);
    }

    /// Mark a worker waiting again after it has replied, refreshing expiry.
    pub fn worker_to_waiting(&mut self, id: &[u8], expiry: Instant) {
        let Some(entry) = self.workers.get_mut(id) else {
            return;
        };
        entry.expiry = expiry;
        let service = entry.service.clone();
        if let Some(svc) = self.services.get_mut(&service) {
            if !svc.waiting.contains(&id.to_vec()) {
                svc.waiting.push_back(id.to_vec());
            }
        }
        if !self.global_waiting.contains(&id.to_vec()) {
            self.global_waiting.push_back(id.to_vec());
        }
    }

    /// Refresh a worker's liveness and move it to the tail of the global
    /// waiting order, per the heartbeat discipline in §4.4/§4.6.
    pub fn renew_heartbeat(&mut self, id: &[u8], expiry: Instant) -> bool {
        let Some(entry) = self.workers.get_mut(id) else {
            return false;
        };
        entry.expiry = expiry;
        if let Some(pos) = self.global_waiting.iter().position(|w| w == id) {
            self.global_waiting.remove(pos);
            self.global_waiting.push_back(id.to_vec());
        }
        true
    }

    /// Remove a worker from every structure. Returns the worker entry if it
    /// existed, so the caller can decide whether to send DISCONNECT.
    pub fn delete_worker(&mut self, id: &[u8]) -> Option<WorkerEntry> {
        let entry = self.workers.remove(id)?;
        if let Some(svc) = self.services.get_mut(&entry.service) {
            svc.waiting.retain(|w| w != id);
            if svc.waiting.is_empty() {
                // last waiting worker gone: drop the service record, and with
                // it any requests still queued (see SPEC_FULL.md §9 — this
                // also covers the "no waiting workers left" case even when
                // requests is non-empty, per the open question on stranding).
                self.services.remove(&entry.service);
            }
        }
        self.global_waiting.retain(|w| w != id);
        Some(entry)
    }

    /// Full scan of the worker registry for expired entries (see §9: a
    /// stop-at-first-non-expired scan would miss workers reordered to the
    /// tail by an intervening heartbeat).
    pub fn purge_expired(&mut self, now: Instant) -> Vec<WorkerId> {
        let expired: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.expiry <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.delete_worker(id);
        }
        expired
    }

    /// Match queued requests against idle workers for one service, in FIFO
    /// order on both sides. Caller purges expired workers first.
    pub fn dispatch(&mut self, service: &str) -> Vec<Dispatch> {
        let mut out = Vec::new();
        loop {
            let Some(entry) = self.services.get_mut(service) else {
                break;
            };
            if entry.requests.is_empty() || entry.waiting.is_empty() {
                break;
            }
            let worker = entry.waiting.pop_front().unwrap();
            let request = entry.requests.pop_front().unwrap();
            self.global_waiting.retain(|w| w != &worker);
            out.push(Dispatch { worker, request });
        }
        out
    }

    pub fn global_waiting(&self) -> &VecDeque<WorkerId> {
        &self.global_waiting
    }
}

pub fn expiry_at(now: Instant, heartbeat_interval: Duration, liveness: u32) -> Instant {
    now + heartbeat_interval * liveness
}
