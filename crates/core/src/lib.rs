//! Shared vocabulary for the novastore volume engine.
//!
//! This crate has no I/O of its own. It defines the data model
//! (cluster addresses and locations, SCO identity, TLog entries,
//! the snapshot manifest shape), the error/result type every subsystem
//! boundary returns, the configuration structs loaded by the volume
//! manager, and the trait surfaces the core consumes from its external
//! collaborators (the backend object store, the DTL server, the
//! metadata server).

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod nsidmap;
pub mod tasks;
pub mod types;

pub use error::{Error, ErrorKind, Result};
