//! nara-core — decentralised presence and neighbourhood clustering.
//!
//! Every participant ("nara") gossips its status over a shared MQTT broker
//! and keeps its own view of who is alive, when each peer first appeared,
//! how often it restarted, and which peers form a latency-proximate cluster
//! (its "barrio"). There is no coordinator: each node reconciles its view
//! with what its neighbours report, by plurality voting.
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use nara_core::{BrokerConfig, LocalNara, Network};
//!
//! # async fn run() -> Result<(), nara_core::BrokerError> {
//! let local = Arc::new(LocalNara::new("rosario"));
//! let config = BrokerConfig {
//!     host: "broker.example.net".into(),
//!     port: 1883,
//!     username: None,
//!     password: None,
//!     client_id: "rosario".into(),
//! };
//!
//! tokio::spawn(nara_core::sensors::run_host_stats(Arc::clone(&local)));
//! let network = Network::start(local, &config).await?;
//! // ... run until shutdown ...
//! network.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod clustering;
pub mod codec;
pub mod local;
pub mod nara;
pub mod network;
pub mod opinion;
pub mod sensors;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerEvent};
pub use codec::CodecError;
pub use local::LocalNara;
pub use nara::{HostStats, Nara, NaraStatus, Observation, OnlineStatus, PingEvent};
pub use network::Network;
