//! chatrelay - provider routing and streaming chat gateway
//!
//! This library provides the pieces of the gateway: provider adapters and
//! their health registry, failover routing, the per-turn stream
//! multiplexer, the conversation ledger and its storage, and the HTTP API
//! that ties them together.

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod provider;
pub mod registry;
pub mod router;
pub mod storage;
pub mod stream;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::{Gateway, TurnHandle, TurnRequest};
