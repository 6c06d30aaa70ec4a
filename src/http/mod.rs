//! HTTP API subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → request.rs (x-request-id, request span)
//!     → server.rs (axum router)
//!         control endpoints → admin (bearer auth) → orchestrator / monitor / router / cache
//!         POST /route/{service}/{operation} → RequestRouter
//!     → response.rs (typed errors → structured JSON)
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{request_id, X_REQUEST_ID};
pub use response::ApiError;
pub use server::{build_router, ApiServer, AppState, X_BACKEND, X_CACHE};
