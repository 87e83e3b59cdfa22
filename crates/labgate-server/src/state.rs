//! Application state shared by the axum handlers.
//!
//! [`AppState`] carries a clone of the [`ArbitrationService`] handle and the
//! [`DisconnectHook`] the WebSocket transport reports dropped clients on. The
//! service is internally synchronized per equipment id, so no outer mutex is
//! needed.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labgate_core::ArbitrationConfig;

use crate::concurrency::{as_millis, DisconnectHook};
use crate::service::ArbitrationService;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    /// The arbitration subsystem.
    pub service: ArbitrationService,
    /// Transport disconnect delivery (WebSocket close -> session end).
    pub disconnect_hook: DisconnectHook,
}

impl AppState {
    /// Creates the service and starts its background tasks.
    ///
    /// The tasks stop when `cancel` fires; their handles are returned so the
    /// caller can await a clean shutdown. Must be called inside a tokio
    /// runtime.
    pub fn new(config: ArbitrationConfig, cancel: CancellationToken) -> (Self, Vec<JoinHandle<()>>) {
        let service = ArbitrationService::new(config);
        let background = service.spawn_background(cancel);
        tracing::info!(
            cleanup_interval_ms = as_millis(service.cleanup().interval()),
            locks_enabled = service.config().enable_equipment_locks,
            "arbitration service started"
        );
        (
            AppState {
                service,
                disconnect_hook: background.disconnect_hook,
            },
            background.handles,
        )
    }

    /// Creates a state with default configuration (for testing).
    ///
    /// Background tasks run until the runtime shuts down.
    pub fn with_defaults() -> Self {
        Self::new(ArbitrationConfig::default(), CancellationToken::new()).0
    }
}
