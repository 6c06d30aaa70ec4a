//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Process (startup.rs):
//!     config → validate → ControlPlane::new (registry, monitor, router, ...)
//!     → spawn background tasks → serve API
//!
//! Managed services (orchestrator.rs, hooks.rs):
//!     startup/shutdown/restart → ServiceHooks → await convergence via health
//!
//! Failures (recovery.rs):
//!     ServiceFailed event → restart with backoff → quarantine when exhausted
//!
//! Shutdown (signals.rs, shutdown.rs):
//!     SIGINT/SIGTERM → stop accepting → Shutdown::trigger → background tasks exit
//! ```

pub mod hooks;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use hooks::{CommandHooks, HookError, HookRegistry, NoopHooks, ServiceHooks, StopMode};
pub use orchestrator::{
    OperationKind, OperationReport, Orchestrator, OrchestratorError, OrchestratorSettings, Outcome, ServiceOutcome,
};
pub use recovery::{RecoveryError, RecoveryManager, RecoveryPhase, RecoverySettings, RecoveryStatus};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::shutdown_signal;
pub use startup::{BackgroundTasks, ControlPlane, StartupError};
