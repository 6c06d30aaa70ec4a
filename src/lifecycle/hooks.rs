//! Service start/stop hooks.
//!
//! # Collaborator Contract
//! ```text
//! start(service)            → service process launched (convergence is observed via health)
//! stop(service, Graceful)   → ask the service to drain and exit
//! stop(service, Force)      → kill it
//! ```
//!
//! Start commands are spawned, not awaited: the process may live as long as
//! the service does. Stop commands run to completion under the caller's deadline.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::config::ServiceConfig;
use crate::registry::ServiceDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    Graceful,
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait ServiceHooks: Send + Sync {
    async fn start(&self, service: &ServiceDescriptor) -> Result<(), HookError>;
    async fn stop(&self, service: &ServiceDescriptor, mode: StopMode) -> Result<(), HookError>;
}

/// For services managed outside the control plane.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl ServiceHooks for NoopHooks {
    async fn start(&self, _service: &ServiceDescriptor) -> Result<(), HookError> {
        Ok(())
    }

    async fn stop(&self, _service: &ServiceDescriptor, _mode: StopMode) -> Result<(), HookError> {
        Ok(())
    }
}

/// Runs configured argv commands.
#[derive(Debug, Clone, Default)]
pub struct CommandHooks {
    pub start_command: Option<Vec<String>>,
    pub stop_command: Option<Vec<String>>,
    pub kill_command: Option<Vec<String>>,
    /// Processes launched by `start_command`, by service.
    children: Arc<DashMap<String, Child>>,
}

impl CommandHooks {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            start_command: config.start_command.clone(),
            stop_command: config.stop_command.clone(),
            kill_command: config.kill_command.clone(),
            children: Arc::default(),
        }
    }

    /// Launch `argv` in the background. Fails only if it cannot be spawned or exits with an error at once.
    fn spawn(&self, service: &str, argv: &[String]) -> Result<(), HookError> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        let command = argv.join(" ");
        tracing::debug!(service = %service, command = %command, "Spawning start command");

        let mut child = Command::new(program)
            .args(args)
            .env("CONTROL_PLANE_SERVICE", service)
            .spawn()
            .map_err(|e| HookError::Command {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        match child.try_wait() {
            Ok(Some(status)) if !status.success() => Err(HookError::Command {
                command,
                reason: format!("exited with {status}"),
            }),
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                self.children.insert(service.to_string(), child);
                Ok(())
            }
            Err(e) => Err(HookError::Command {
                command,
                reason: e.to_string(),
            }),
        }
    }

    /// Kill the process launched for `service`, if it is still tracked.
    async fn kill_child(&self, service: &str) -> Result<bool, HookError> {
        let Some((_, mut child)) = self.children.remove(service) else {
            return Ok(false);
        };
        child.kill().await.map_err(|e| HookError::Failed(format!("kill: {e}")))?;
        Ok(true)
    }

    async fn run(service: &str, argv: &[String]) -> Result<(), HookError> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        let command = argv.join(" ");
        tracing::debug!(service = %service, command = %command, "Running hook command");

        let status = Command::new(program)
            .args(args)
            .env("CONTROL_PLANE_SERVICE", service)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| HookError::Command {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(HookError::Command {
                command,
                reason: format!("exited with {status}"),
            })
        }
    }
}

#[async_trait]
impl ServiceHooks for CommandHooks {
    async fn start(&self, service: &ServiceDescriptor) -> Result<(), HookError> {
        match &self.start_command {
            Some(argv) => self.spawn(&service.name, argv),
            None => Ok(()),
        }
    }

    async fn stop(&self, service: &ServiceDescriptor, mode: StopMode) -> Result<(), HookError> {
        match mode {
            StopMode::Graceful => {
                if let Some(argv) = &self.stop_command {
                    Self::run(&service.name, argv).await?;
                }
                self.children.remove(&service.name);
                Ok(())
            }
            StopMode::Force => {
                if let Some(argv) = &self.kill_command {
                    Self::run(&service.name, argv).await?;
                    self.children.remove(&service.name);
                    return Ok(());
                }
                if self.kill_child(&service.name).await? {
                    return Ok(());
                }
                match &self.stop_command {
                    Some(argv) => Self::run(&service.name, argv).await,
                    None => Ok(()),
                }
            }
        }
    }
}

/// Hooks per service; unregistered services get [`NoopHooks`].
pub struct HookRegistry {
    hooks: DashMap<String, Arc<dyn ServiceHooks>>,
    fallback: Arc<dyn ServiceHooks>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: DashMap::new(),
            fallback: Arc::new(NoopHooks),
        }
    }

    pub fn from_config(services: &[ServiceConfig]) -> Self {
        let registry = Self::new();
        for service in services.iter().filter(|s| s.has_commands()) {
            registry.register(&service.name, Arc::new(CommandHooks::from_config(service)));
        }
        registry
    }

    pub fn register(&self, service: &str, hooks: Arc<dyn ServiceHooks>) {
        self.hooks.insert(service.to_string(), hooks);
    }

    pub fn get(&self, service: &str) -> Arc<dyn ServiceHooks> {
        self.hooks
            .get(service)
            .map(|h| h.value().clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ServiceKind, ServiceSpec};

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::from_spec(ServiceSpec::new("db", ServiceKind::Database))
    }

    #[tokio::test]
    async fn test_command_exit_status() {
        let hooks = CommandHooks {
            start_command: Some(vec!["true".into()]),
            stop_command: Some(vec!["false".into()]),
            ..CommandHooks::default()
        };
        assert!(hooks.start(&descriptor()).await.is_ok());

        let err = hooks.stop(&descriptor(), StopMode::Graceful).await.unwrap_err();
        assert!(matches!(err, HookError::Command { ref command, .. } if command == "false"));
    }

    #[tokio::test]
    async fn test_force_falls_back_to_stop_command() {
        let hooks = CommandHooks {
            stop_command: Some(vec!["false".into()]),
            ..CommandHooks::default()
        };
        let err = hooks.stop(&descriptor(), StopMode::Force).await.unwrap_err();
        assert!(matches!(err, HookError::Command { ref command, .. } if command == "false"));
    }

    #[tokio::test]
    async fn test_long_running_start_command_returns_and_is_killed() {
        let hooks = CommandHooks {
            start_command: Some(vec!["sleep".into(), "30".into()]),
            ..CommandHooks::default()
        };
        let started = tokio::time::timeout(std::time::Duration::from_secs(5), hooks.start(&descriptor())).await;
        assert!(matches!(started, Ok(Ok(()))), "start must not wait for the process to exit");
        assert!(hooks.children.contains_key("db"));

        hooks.stop(&descriptor(), StopMode::Force).await.unwrap();
        assert!(!hooks.children.contains_key("db"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let hooks = CommandHooks {
            start_command: Some(vec!["/nonexistent/control-plane-hook".into()]),
            ..CommandHooks::default()
        };
        assert!(hooks.start(&descriptor()).await.is_err());
    }

    #[tokio::test]
    async fn test_registry_only_holds_services_with_commands() {
        let services: Vec<ServiceConfig> = toml::from_str::<crate::config::ControlPlaneConfig>(
            r#"
            [[services]]
            name = "db"
            kind = "database"
            start_command = ["true"]

            [[services]]
            name = "external"
            kind = "gateway"
            "#,
        )
        .unwrap()
        .services;

        let registry = HookRegistry::from_config(&services);
        assert!(registry.hooks.contains_key("db"));
        assert!(!registry.hooks.contains_key("external"));
        assert!(registry.get("external").start(&descriptor()).await.is_ok());
    }
}
