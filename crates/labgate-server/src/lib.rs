//! Equipment access arbitration for shared lab instruments.
//!
//! Provides the lock manager, session registry, permission gate and cleanup
//! scheduler behind [`service::ArbitrationService`], plus a thin HTTP and
//! WebSocket surface for administration and client heartbeats.

pub mod concurrency;
pub mod error;
pub mod handlers;
pub mod router;
pub mod schema;
pub mod service;
pub mod state;
