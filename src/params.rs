//! # Parameter adapter
//! Maps a battery level onto the operating parameters of the controller:
//! search radius, refresh cadence and location accuracy tier.
//!
//! The rule is a single breakpoint at 30% charge. An optional dead-band can
//! be configured to keep a level hovering around the breakpoint from
//! restarting the location tracker on every sample; it is off by default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sensors::AccuracyTier;

pub const LOW_BATTERY_THRESHOLD: f32 = 0.3;

pub const NORMAL_RADIUS_M: u32 = 5_000;
pub const SAVER_RADIUS_M: u32 = 10_000;
pub const NORMAL_REFRESH_MS: u64 = 300_000;
pub const SAVER_REFRESH_MS: u64 = 600_000;

/// Upper bound for the configurable dead-band.
pub const MAX_HYSTERESIS: f32 = 0.2;

/// Level assumed when the battery gauge is unavailable (least conservative).
pub const DEFAULT_BATTERY_LEVEL: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingParameters {
    pub radius_meters: u32,
    pub refresh_interval_ms: u64,
    pub accuracy: AccuracyTier,
}

impl OperatingParameters {
    pub fn normal() -> Self {
        Self {
            radius_meters: NORMAL_RADIUS_M,
            refresh_interval_ms: NORMAL_REFRESH_MS,
            accuracy: AccuracyTier::High,
        }
    }

    pub fn power_saver() -> Self {
        Self {
            radius_meters: SAVER_RADIUS_M,
            refresh_interval_ms: SAVER_REFRESH_MS,
            accuracy: AccuracyTier::Low,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn is_power_saver(&self) -> bool {
        self.accuracy == AccuracyTier::Low
    }
}

/// Clamp a raw reading into [0, 1]. NaN reads as a full battery.
pub fn clamp_level(level: f32) -> f32 {
    if level.is_nan() {
        return DEFAULT_BATTERY_LEVEL;
    }
    level.clamp(0.0, 1.0)
}

/// The plain threshold rule.
pub fn adapt(level: f32) -> OperatingParameters {
    if clamp_level(level) < LOW_BATTERY_THRESHOLD {
        OperatingParameters::power_saver()
    } else {
        OperatingParameters::normal()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParameterAdapter {
    hysteresis: f32,
}

impl ParameterAdapter {
    /// `hysteresis` outside [0, MAX_HYSTERESIS] is clamped; 0 disables the dead-band.
    pub fn with_hysteresis(hysteresis: f32) -> Self {
        let h = if hysteresis.is_finite() {
            hysteresis.clamp(0.0, MAX_HYSTERESIS)
        } else {
            0.0
        };
        Self { hysteresis: h }
    }

    pub fn hysteresis(&self) -> f32 {
        self.hysteresis
    }

    /// Recompute parameters for `level` given the parameters currently in effect.
    ///
    /// Entering power-saver always happens below the breakpoint. Leaving it
    /// requires `level >= threshold + hysteresis`.
    pub fn adapt(&self, level: f32, current: &OperatingParameters) -> OperatingParameters {
        let level = clamp_level(level);
        if self.hysteresis > 0.0
            && current.is_power_saver()
            && level < LOW_BATTERY_THRESHOLD + self.hysteresis
        {
            return OperatingParameters::power_saver();
        }
        adapt(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_is_exclusive() {
        assert_eq!(adapt(0.29), OperatingParameters::power_saver());
        assert_eq!(adapt(0.3), OperatingParameters::normal());
        assert_eq!(adapt(1.0).radius_meters, 5_000);
        assert_eq!(adapt(0.0).refresh_interval_ms, 600_000);
    }

    #[test]
    fn out_of_range_levels_are_clamped() {
        assert_eq!(adapt(-0.5), OperatingParameters::power_saver());
        assert_eq!(adapt(7.0), OperatingParameters::normal());
        assert_eq!(adapt(f32::NAN), OperatingParameters::normal());
    }

    #[test]
    fn default_adapter_matches_plain_rule() {
        let a = ParameterAdapter::default();
        let saver = OperatingParameters::power_saver();
        assert_eq!(a.adapt(0.31, &saver), OperatingParameters::normal());
        assert_eq!(
            a.adapt(0.29, &OperatingParameters::normal()),
            OperatingParameters::power_saver()
        );
    }

    #[test]
    fn dead_band_holds_power_saver_until_recovered() {
        let a = ParameterAdapter::with_hysteresis(0.05);
        let saver = OperatingParameters::power_saver();
        assert_eq!(a.adapt(0.32, &saver), saver);
        assert_eq!(a.adapt(0.35, &saver), OperatingParameters::normal());
        // Entering stays at the plain breakpoint.
        assert_eq!(a.adapt(0.29, &OperatingParameters::normal()), saver);
    }

    #[test]
    fn hysteresis_is_bounded() {
        assert_eq!(ParameterAdapter::with_hysteresis(0.9).hysteresis(), MAX_HYSTERESIS);
        assert_eq!(ParameterAdapter::with_hysteresis(-1.0).hysteresis(), 0.0);
        assert_eq!(ParameterAdapter::with_hysteresis(f32::NAN).hysteresis(), 0.0);
    }
}
