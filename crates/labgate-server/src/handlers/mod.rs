//! HTTP handler modules for the labgate API.
//!
//! Each sub-module implements thin handlers that parse requests, delegate to
//! [`ArbitrationService`](crate::service::ArbitrationService), and return JSON
//! responses. No arbitration logic lives in handlers.

pub mod commands;
pub mod locks;
pub mod sessions;
pub mod ws;
