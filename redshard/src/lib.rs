//! Cluster-aware async RESP client.
//!
//! `redshard` talks to sharded, RESP-speaking key/value servers through
//! three layers, each usable on its own:
//!
//! - [`Conn`]: one pipelined connection. Many tasks issue requests
//!   concurrently over a single socket with FIFO reply correlation.
//! - [`Pool`]: a sized set of hot connections per node, with configurable
//!   empty/full policies and a sticky I/O-error gate deciding reusability.
//! - [`Cluster`]: the router. It caches the slot map from `CLUSTER SLOTS`,
//!   routes by key slot and follows MOVED/ASK redirects through live slot
//!   migrations.
//!
//! # Quick start
//!
//! ```no_run
//! use redshard::{Cluster, ClusterConfig, Cmd, TcpConnector};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = ClusterConfig::new(["127.0.0.1:7000", "127.0.0.1:7001"]);
//!     let cluster = Cluster::new(cfg, Arc::new(TcpConnector::default())).await?;
//!
//!     cluster.run(&Cmd::new("SET").key("foo").arg("bar")).await?;
//!     let reply = cluster.run(&Cmd::new("GET").key("foo")).await?;
//!     println!("foo = {:?}", reply.as_str()?);
//!     Ok(())
//! }
//! ```

#![deny(warnings)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]

pub mod cluster;
pub mod cmd;
pub mod conn;
pub mod pool;
pub mod protocol;
pub mod script;
pub mod trace;

#[cfg(test)]
mod testsupport;

pub use cluster::{calculate_slot, parse_cluster_slots, Cluster};
pub use cmd::{Cmd, Pipeline};
pub use conn::{dial, Conn, DialConfig};
pub use pool::{Connector, IoErrConn, Pool, TcpConnector};
pub use script::EvalScript;

pub use redshard_core::{
    ClusterConfig, Error, Node, OnEmpty, OnFull, PoolConfig, RespValue, Result, SlotRange,
    Topology,
};

#[cfg(feature = "enable-tls")]
pub use conn::TlsSettings;
