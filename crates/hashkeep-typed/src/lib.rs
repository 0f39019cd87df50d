//! HashKeep typed values
//!
//! The engine only stores byte strings. This crate adds a tagged value
//! layer on top so callers can store strings, integers, doubles and raw
//! bytes and read each back as the kind it was written as.
//!
//! # Architecture
//!
//! - Each value is stored as `[tag][payload]` (see [`value`])
//! - Keys are passed through to the engine unchanged
//! - Read-modify-write helpers run inside an engine transaction

pub mod db;
pub mod error;
pub mod value;

pub use db::TypedDb;
pub use error::{TypedError, TypedResult};
pub use value::Value;
