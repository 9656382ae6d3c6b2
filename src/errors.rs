//! Error taxonomy shared by sensors, providers and the refresh controller.
//!
//! Errors are `Clone + Serialize` so they can sit inside `ControllerState`
//! snapshots handed to observers and returned over HTTP.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoutError {
    /// Location permission was not granted by the platform.
    #[error("location permission denied")]
    PermissionDenied,

    /// No fix could be obtained (no signal, first-fix timeout, ...).
    #[error("position unavailable: {reason}")]
    PositionUnavailable { reason: String },

    /// A sensor (usually the battery gauge) is missing on this device.
    #[error("{sensor} sensor unavailable")]
    SensorUnavailable { sensor: String },

    #[error("{provider} request timed out after {after_ms} ms")]
    Timeout { provider: String, after_ms: u64 },

    /// Network failure, non-2xx status or undecodable payload.
    #[error("{provider} transport error: {message}")]
    Transport { provider: String, message: String },

    /// Skip condition: no category selected, so nothing to search for.
    #[error("no categories selected")]
    EmptyFilter,

    #[error("controller stopped")]
    Stopped,
}

impl ScoutError {
    pub fn position_unavailable(reason: impl Into<String>) -> Self {
        Self::PositionUnavailable {
            reason: reason.into(),
        }
    }

    pub fn sensor_unavailable(sensor: impl Into<String>) -> Self {
        Self::SensorUnavailable {
            sensor: sensor.into(),
        }
    }

    pub fn transport(provider: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    /// Fetch failures worth a backoff retry; anything else waits for the
    /// next trigger.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }

    /// Location errors that persist until a fix arrives (or, for a revoked
    /// grant, until it is restored). They are never retried on a timer.
    pub fn is_location_fault(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied | Self::PositionUnavailable { .. }
        )
    }
}
