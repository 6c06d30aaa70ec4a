//! Service descriptor records.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Category of a managed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Database,
    AiService,
    Gateway,
    Cache,
    Processing,
}

/// Lifecycle state of a registered service.
///
/// Only [`ServiceRegistry`](super::ServiceRegistry) mutates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
    Stopped,
}

impl ServiceState {
    /// States in which health probe results are applied.
    pub fn is_monitored(self) -> bool {
        !matches!(self, ServiceState::Stopping | ServiceState::Stopped)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Starting => "starting",
            ServiceState::Healthy => "healthy",
            ServiceState::Degraded => "degraded",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(ServiceKind::Database),
            "ai_service" => Ok(ServiceKind::AiService),
            "gateway" => Ok(ServiceKind::Gateway),
            "cache" => Ok(ServiceKind::Cache),
            "processing" => Ok(ServiceKind::Processing),
            other => Err(format!("unknown service kind '{}'", other)),
        }
    }
}

/// Input record for registration. `dependents` and `state` are owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub kind: ServiceKind,
    pub endpoint: String,
    pub health_endpoint: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub probe_interval_secs: Option<u64>,
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

impl ServiceSpec {
    /// Minimal spec used by tests and programmatic registration.
    pub fn new(name: impl Into<String>, kind: ServiceKind) -> Self {
        let name = name.into();
        Self {
            endpoint: format!("http://{}", name),
            health_endpoint: format!("http://{}/health", name),
            name,
            kind,
            dependencies: BTreeSet::new(),
            critical: false,
            probe_interval_secs: None,
            drain_timeout_secs: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn with_endpoints(mut self, endpoint: impl Into<String>, health: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self.health_endpoint = health.into();
        self
    }
}

/// A registered service with its derived and runtime fields.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub kind: ServiceKind,
    pub endpoint: String,
    pub health_endpoint: String,
    pub dependencies: BTreeSet<String>,
    pub dependents: BTreeSet<String>,
    pub critical: bool,
    pub state: ServiceState,
    pub probe_interval_secs: Option<u64>,
    pub drain_timeout_secs: Option<u64>,
    /// Set when automatic recovery gave up; cleared by manual restart.
    pub quarantined: bool,
}

impl ServiceDescriptor {
    pub(crate) fn from_spec(spec: ServiceSpec) -> Self {
        Self {
            name: spec.name,
            kind: spec.kind,
            endpoint: spec.endpoint,
            health_endpoint: spec.health_endpoint,
            dependencies: spec.dependencies,
            dependents: BTreeSet::new(),
            critical: spec.critical,
            state: ServiceState::Unknown,
            probe_interval_secs: spec.probe_interval_secs,
            drain_timeout_secs: spec.drain_timeout_secs,
            quarantined: false,
        }
    }

    /// Whether this service, as a dependency, lets its dependents run.
    ///
    /// `Degraded` is enough unless the service is marked critical.
    pub fn satisfies_dependents(&self) -> bool {
        match self.state {
            ServiceState::Healthy => true,
            ServiceState::Degraded => !self.critical,
            _ => false,
        }
    }
}
