//! Wire types for the Pictor generation network.
//!
//! This crate contains the serde-serializable shapes exchanged with the
//! service over the persistent socket and the REST API. Types here are:
//! * Pure data: no I/O, no behavior beyond (de)serialization
//! * 1:1 with the wire: field names match what the server sends
//!
//! The session layer in `pictor-client` is the only place that interprets
//! these vendor-shaped payloads; nothing above it should need this crate.

pub mod close_code;
pub mod envelope;
pub mod error_code;
pub mod events;
pub mod request;
pub mod rest;

pub use close_code::*;
pub use envelope::*;
pub use error_code::*;
pub use events::*;
pub use request::*;
pub use rest::*;
