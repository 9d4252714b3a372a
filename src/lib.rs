pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod mgmt;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod worker;

pub use auth::{AuthCallback, Authenticator};
pub use broker::Broker;
pub use client::MdpClient;
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use fanout::Publisher;
pub use metrics::BrokerMetrics;
pub use protocol::{Channel, Command, CLIENT_HEADER, WORKER_HEADER};
pub use registry::Registry;
pub use transport::Transport;
pub use worker::{MdpWorker, WorkerBuilder};
