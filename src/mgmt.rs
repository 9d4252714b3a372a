//! In-broker handling of the `mmi.*` management services (§4.7).
//!
//! Replies are synthesized here and never dispatched to a worker.

use serde::Serialize;

use crate::protocol::MMI_PREFIX;
use crate::registry::Registry;

pub fn is_management_service(name: &str) -> bool {
    name.starts_with(MMI_PREFIX)
}

#[derive(Serialize)]
struct ServicesReply {
    services: Vec<String>,
}

#[derive(Serialize)]
struct WorkersReply {
    workers: Vec<String>,
}

/// Handle a management request. `body` is the request's body frames; the
/// return value is the single reply body frame.
pub fn handle(registry: &Registry, service: &str, body: &[Vec<u8>]) -> Vec<u8> {
    match service {
        "mmi.service" => {
            let queried = body
                .first()
                .map(|f| String::from_utf8_lossy(f).to_string())
                .unwrap_or_default();
            let known = registry.lookup_service(&queried).is_some();
            if known {
                b"200".to_vec()
            } else {
                b"404".to_vec()
            }
        }
        "mmi.services" => {
            let reply = ServicesReply {
                services: registry.known_services(),
            };
            serde_json::to_vec(&reply).unwrap_or_default()
        }
        "mmi.workers" => {
            let reply = WorkersReply {
                workers: registry
                    .known_workers()
                    .into_iter()
                    .map(|id| String::from_utf8_lossy(&id).to_string())
                    .collect(),
            };
            serde_json::to_vec(&reply).unwrap_or_default()
        }
        _ => b"501".to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Channel;
    use std::time::{Duration, Instant};

    #[test]
    fn mmi_service_found_and_not_found() {
        let mut reg = Registry::new();
        reg.ready(
            b"w1".to_vec(),
            "echo",
            Channel::Plaintext,
            Instant::now() + Duration::from_secs(10),
        );
        assert_eq!(handle(&reg, "mmi.service", &[b"echo".to_vec()]), b"200");
        assert_eq!(handle(&reg, "mmi.service", &[b"nope".to_vec()]), b"404");
    }

    #[test]
    fn mmi_services_lists_known_services() {
        let mut reg = Registry::new();
        reg.ready(
            b"w1".to_vec(),
            "echo",
            Channel::Plaintext,
            Instant::now() + Duration::from_secs(10),
        );
        let body = handle(&reg, "mmi.services", &[]);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["services"], serde_json::json!(["echo"]));
    }

    #[test]
    fn mmi_workers_lists_known_workers() {
        let mut reg = Registry::new();
        reg.ready(
            b"w1".to_vec(),
            "echo",
            Channel::Plaintext,
            Instant::now() + Duration::from_secs(10),
        );
        let body = handle(&reg, "mmi.workers", &[]);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["workers"], serde_json::json!(["w1"]));
    }

    #[test]
    fn unknown_mmi_name_returns_501() {
        let reg = Registry::new();
        assert_eq!(handle(&reg, "mmi.bogus", &[]), b"501");
    }

    #[test]
    fn is_management_service_checks_prefix() {
        assert!(is_management_service("mmi.service"));
        assert!(!is_management_service("echo"));
    }
}
