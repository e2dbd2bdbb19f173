//! Core types shared by the `redshard` cluster client.
//!
//! This crate carries the pieces that have no opinion about I/O: the error
//! taxonomy, configuration knobs, cluster topology types and the RESP value
//! enum. The `redshard` crate layers the connection actor, pool and router
//! on top of these.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{ClusterConfig, OnEmpty, OnFull, PoolConfig};
pub use error::{Error, Result};
pub use types::{Node, SlotRange, Topology};
pub use value::RespValue;
