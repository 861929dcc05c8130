//! Durable blob-store capability for Satchel.
//!
//! The engine never touches persistent storage directly; it is handed a
//! [`BlobStore`] at construction. This module defines that capability and
//! ships two implementations: an in-memory store for tests and a local
//! filesystem store with atomic writes.
//!
//! # Design Principles
//! - Capability injection: any durable key-value backend can be substituted
//! - Async operations: all I/O operations are async
//! - Absence is a value: reading a missing key returns `None`, never an error

pub mod adapter;
pub mod local;
pub mod memory;

pub use adapter::BlobStore;
pub use local::LocalStore;
pub use memory::MemoryStore;
