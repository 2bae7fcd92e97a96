//! A minimal PostgreSQL v3 front-end protocol client.
//!
//! This crate speaks just enough of the protocol for read-only introspection:
//! startup with optional TLS upgrade, trust / cleartext / MD5 / SCRAM-SHA-256
//! authentication, and the simple query sub-protocol with text-format results.
//! Handles are used by one scrape at a time and are never multiplexed; any
//! protocol violation poisons the handle.
//!
//! The [`scram`] module also carries the server-side verifier used by the
//! exporter's remote management endpoint.

mod connection;
mod error;
pub mod message;
mod rowset;
pub mod scram;
pub mod tls;

pub use connection::{ConnectOptions, Connection};
pub use error::WireError;
pub use rowset::{Row, RowSet};
