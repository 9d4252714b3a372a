use serde::{Deserialize, Serialize};

/// Transport layer for ZeroMQ connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Inter-process communication via Unix domain sockets.
    /// Fastest option for same-host communication.
    Ipc(String),

    /// TCP transport for distributed deployment.
    Tcp { host: String, port: u16 },
}

impl Transport {
    /// Create an IPC transport with the given socket name.
    ///
    /// The name is used as a path component under `/tmp/stupid-bahnhof/`.
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    /// Create a TCP transport with the given host and port.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Generate the ZeroMQ endpoint address string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) => format!("ipc:///tmp/stupid-bahnhof/{name}.sock"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// Filesystem path backing an IPC endpoint, if this is one.
    fn ipc_path(&self) -> Option<std::path::PathBuf> {
        match self {
            Self::Ipc(name) => Some(std::path::PathBuf::from(format!(
                "/tmp/stupid-bahnhof/{name}.sock"
            ))),
            Self::Tcp { .. } => None,
        }
    }

    /// Ensure the parent directory of an IPC socket path exists.
    ///
    /// No-op for TCP transports.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// Remove a leftover socket file from a previous run before binding.
    ///
    /// `zeromq`'s IPC transport refuses to bind over an existing file, so a
    /// broker killed without cleanup would otherwise fail to restart.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_endpoint() {
        let t = Transport::ipc("broker");
        assert_eq!(t.endpoint(), "ipc:///tmp/stupid-bahnhof/broker.sock");
    }

    #[test]
    fn tcp_endpoint() {
        let t = Transport::tcp("127.0.0.1", 5555);
        assert_eq!(t.endpoint(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn display_matches_endpoint() {
        let t = Transport::tcp("localhost", 9090);
        assert_eq!(t.to_string(), t.endpoint());
    }

    #[test]
    fn tcp_ensure_and_remove_are_noops() {
        let t = Transport::tcp("127.0.0.1", 5555);
        t.ensure_ipc_dir().unwrap();
        t.remove_stale_socket().unwrap();
    }

    #[test]
    fn ipc_remove_stale_socket_missing_is_ok() {
        let t = Transport::ipc("does-not-exist-12345");
        t.remove_stale_socket().unwrap();
    }
}
