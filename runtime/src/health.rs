//! Liveness and readiness state shared between the consumer supervisor and
//! the HTTP health endpoints.
//!
//! The supervisor records its connection state in a [`HealthState`]; the
//! service combines it with a database ping into a [`HealthReport`].

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Health status of a component or of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,

    /// Operational but recovering (e.g., reconnecting to the broker)
    Degraded,

    /// Not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Connection state of the intent consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not connected yet.
    Starting,
    /// Subscribed and consuming.
    Connected,
    /// Lost the connection; reconnect attempts are in progress.
    Reconnecting,
    /// Gave up after too many consecutive failures.
    Failed,
}

impl ConsumerState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Connected => 1,
            Self::Reconnecting => 2,
            Self::Failed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Connected,
            2 => Self::Reconnecting,
            _ => Self::Failed,
        }
    }

    /// Health contribution of this state.
    #[must_use]
    pub const fn status(self) -> HealthStatus {
        match self {
            Self::Connected => HealthStatus::Healthy,
            Self::Reconnecting => HealthStatus::Degraded,
            Self::Starting | Self::Failed => HealthStatus::Unhealthy,
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        })
    }
}

/// Shared, cloneable consumer state.
#[derive(Debug, Clone)]
pub struct HealthState {
    consumer: Arc<AtomicU8>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a state with the consumer still starting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            consumer: Arc::new(AtomicU8::new(ConsumerState::Starting.to_u8())),
        }
    }

    /// Record a new consumer state.
    pub fn set_consumer(&self, state: ConsumerState) {
        self.consumer.store(state.to_u8(), Ordering::SeqCst);
    }

    /// Current consumer state.
    #[must_use]
    pub fn consumer(&self) -> ConsumerState {
        ConsumerState::from_u8(self.consumer.load(Ordering::SeqCst))
    }
}

/// Result of checking one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    /// Create a check result with a status and message
    #[must_use]
    pub fn with_status(component: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message: Some(message.into()),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, message)
    }

    /// Check result for the consumer in `state`.
    #[must_use]
    pub fn consumer(state: ConsumerState) -> Self {
        match state.status() {
            HealthStatus::Healthy => Self::healthy("consumer"),
            status => Self::with_status("consumer", status, state.to_string()),
        }
    }
}

/// Aggregated health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Combine component checks.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        Self { status, checks }
    }

    /// Whether the service should receive traffic.
    ///
    /// A degraded consumer still counts as ready; only an unhealthy
    /// component takes the service out of rotation.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        !self.status.is_unhealthy()
    }
}
