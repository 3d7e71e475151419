//! Multi-source strike velocity
//!
//! Velocity can come from keypress timing, touchpad pressure, keyboard row
//! position, a prioritized combination, or a fixed constant. Whatever the
//! source, the result is always in [1, 127]: velocity 0 would read as a
//! note-off to the renderer.
//!
//! Source selection happens once per key-down; a sounding note never
//! switches sources mid-flight.

use serde::{Deserialize, Serialize};

use crate::keymap::Row;
use crate::types::{VelocityInfo, VelocitySource, BASELINE_VELOCITY};

/// Which velocity source drives note strikes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VelocityMode {
    Timing,
    Pressure,
    Position,
    #[default]
    Combined,
    Fixed,
}

/// Curve mapping the inter-keypress gap to [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingCurve {
    Linear,
    #[default]
    Logarithmic,
    Exponential,
}

/// Velocity computer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityConfig {
    pub mode: VelocityMode,
    pub curve: TimingCurve,
    /// Timing window W in seconds; gaps are clamped to [1 ms, W]
    pub window_secs: f32,
    /// Timing output range
    pub min: u8,
    pub max: u8,
    /// Pressure below this reads as zero
    pub pressure_threshold: f32,
    /// Exponential smoothing factor alpha; 0 disables smoothing
    pub pressure_smoothing: f32,
    /// Per-row constants for position velocity
    pub row_bottom: u8,
    pub row_home: u8,
    pub row_top: u8,
    /// Shift adds 20, Ctrl subtracts 20 when enabled
    pub modifier_offset: bool,
    /// Constant for fixed mode
    pub fixed: u8,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            mode: VelocityMode::default(),
            curve: TimingCurve::default(),
            window_secs: 0.5,
            min: 30,
            max: 127,
            pressure_threshold: 0.05,
            pressure_smoothing: 0.0,
            row_bottom: 40,
            row_home: 80,
            row_top: 110,
            modifier_offset: true,
            fixed: 100,
        }
    }
}

/// Modifier offset applied on top of row constants
const MODIFIER_DELTA: i16 = 20;

/// Smallest timing gap considered, in seconds
const MIN_GAP_SECS: f32 = 0.001;

/// Computes strike velocities from the configured source.
///
/// Owned by the fan-in task; sees every key-down and every pressure sample
/// in input order, so selection is deterministic for a given event stream.
pub struct VelocityComputer {
    config: VelocityConfig,
    last_keydown_ns: Option<u64>,
    pressure: f32,
}

impl VelocityComputer {
    pub fn new(config: VelocityConfig) -> Self {
        Self {
            config,
            last_keydown_ns: None,
            pressure: 0.0,
        }
    }

    pub fn config(&self) -> &VelocityConfig {
        &self.config
    }

    /// Feed a normalized pressure sample from the touchpad.
    ///
    /// Sub-threshold readings count as zero; smoothing (when enabled) runs
    /// before the curve so the curve always sees the settled value.
    pub fn pressure_sample(&mut self, normalized: f32) {
        let p = if normalized < self.config.pressure_threshold {
            0.0
        } else {
            normalized.clamp(0.0, 1.0)
        };
        let alpha = self.config.pressure_smoothing.clamp(0.0, 1.0);
        self.pressure = (1.0 - alpha) * p + alpha * self.pressure;
    }

    /// Current (smoothed) pressure, for telemetry
    pub fn pressure(&self) -> f32 {
        self.pressure
    }

    /// Compute the velocity for a key-down at monotonic time `t_ns`.
    ///
    /// `row` is the key's keyboard row if it has one, `touching` whether a
    /// touchpad contact is active, and `shift`/`ctrl` the modifier state at
    /// the strike.
    pub fn strike(
        &mut self,
        t_ns: u64,
        row: Option<Row>,
        touching: bool,
        shift: bool,
        ctrl: bool,
    ) -> VelocityInfo {
        let info = match self.config.mode {
            VelocityMode::Fixed => {
                VelocityInfo::new(self.config.fixed.clamp(1, 127), VelocitySource::Fixed)
            }
            VelocityMode::Timing => self.from_timing(t_ns),
            VelocityMode::Pressure => self.from_pressure(),
            VelocityMode::Position => self.from_position(row.unwrap_or(Row::Home), shift, ctrl),
            VelocityMode::Combined => {
                // Priority: pressure > position > timing. Pressure only
                // counts while a contact is active and above threshold.
                if touching && self.pressure >= self.config.pressure_threshold {
                    self.from_pressure()
                } else if let Some(row) = row {
                    self.from_position(row, shift, ctrl)
                } else {
                    self.from_timing(t_ns)
                }
            }
        };
        self.last_keydown_ns = Some(t_ns);
        info
    }

    fn from_timing(&self, t_ns: u64) -> VelocityInfo {
        let (min, max) = (self.config.min as f32, self.config.max as f32);
        let value = match self.last_keydown_ns {
            None => BASELINE_VELOCITY.clamp(self.config.min, self.config.max),
            Some(last) => {
                let w = self.config.window_secs;
                let gap = ((t_ns.saturating_sub(last)) as f32 / 1e9).clamp(MIN_GAP_SECS, w);
                let norm = match self.config.curve {
                    TimingCurve::Linear => 1.0 - gap / w,
                    TimingCurve::Logarithmic => 1.0 - (1.0 + gap).ln() / (1.0 + w).ln(),
                    TimingCurve::Exponential => (-3.0 * gap / w).exp(),
                };
                (min + norm * (max - min)).round() as u8
            }
        };
        VelocityInfo::new(value.clamp(1, 127), VelocitySource::Timing)
    }

    fn from_pressure(&self) -> VelocityInfo {
        let shaped = match self.config.curve {
            TimingCurve::Linear => self.pressure,
            TimingCurve::Logarithmic => (1.0 + self.pressure).ln() / 2f32.ln(),
            TimingCurve::Exponential => {
                (1.0 - (-3.0 * self.pressure).exp()) / (1.0 - (-3.0f32).exp())
            }
        };
        let value = (1.0 + shaped * 126.0).round() as u8;
        VelocityInfo::new(value.clamp(1, 127), VelocitySource::Pressure)
    }

    fn from_position(&self, row: Row, shift: bool, ctrl: bool) -> VelocityInfo {
        let base = match row {
            Row::Bottom => self.config.row_bottom,
            Row::Home => self.config.row_home,
            Row::Top => self.config.row_top,
        };
        let mut value = base as i16;
        if self.config.modifier_offset {
            if shift {
                value += MODIFIER_DELTA;
            }
            if ctrl {
                value -= MODIFIER_DELTA;
            }
        }
        VelocityInfo::new(value.clamp(1, 127) as u8, VelocitySource::Position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing_computer(curve: TimingCurve) -> VelocityComputer {
        VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Timing,
            curve,
            ..VelocityConfig::default()
        })
    }

    #[test]
    fn test_first_strike_uses_baseline() {
        let mut vc = timing_computer(TimingCurve::Logarithmic);
        let info = vc.strike(0, None, false, false, false);
        assert_eq!(info.value, 80);
        assert_eq!(info.source, VelocitySource::Timing);
    }

    #[test]
    fn test_fast_second_strike_is_louder_than_baseline() {
        let mut vc = timing_computer(TimingCurve::Logarithmic);
        vc.strike(0, None, false, false, false);
        let info = vc.strike(50_000_000, None, false, false, false);
        assert!(info.value > 80, "50ms gap gave {}", info.value);
        // 1 - ln(1.05)/ln(1.5) scaled to 30..=127
        assert!((113..=117).contains(&info.value), "got {}", info.value);
    }

    #[test]
    fn test_slow_strike_approaches_min() {
        let mut vc = timing_computer(TimingCurve::Linear);
        vc.strike(0, None, false, false, false);
        // Gap beyond the window clamps to W, norm = 0
        let info = vc.strike(2_000_000_000, None, false, false, false);
        assert_eq!(info.value, 30);
    }

    #[test]
    fn test_timing_curves_are_monotonic() {
        for curve in [
            TimingCurve::Linear,
            TimingCurve::Logarithmic,
            TimingCurve::Exponential,
        ] {
            let mut vc = timing_computer(curve);
            vc.strike(0, None, false, false, false);
            let fast = vc.strike(10_000_000, None, false, false, false).value;
            let mut vc = timing_computer(curve);
            vc.strike(0, None, false, false, false);
            let slow = vc.strike(400_000_000, None, false, false, false).value;
            assert!(fast > slow, "{:?}: fast {} <= slow {}", curve, fast, slow);
        }
    }

    #[test]
    fn test_pressure_threshold_reads_zero() {
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Pressure,
            ..VelocityConfig::default()
        });
        vc.pressure_sample(0.01);
        let info = vc.strike(0, None, true, false, false);
        assert_eq!(info.value, 1);
        assert_eq!(info.source, VelocitySource::Pressure);
    }

    #[test]
    fn test_pressure_full_scale() {
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Pressure,
            curve: TimingCurve::Linear,
            ..VelocityConfig::default()
        });
        vc.pressure_sample(1.0);
        assert_eq!(vc.strike(0, None, true, false, false).value, 127);
    }

    #[test]
    fn test_pressure_smoothing_lags_input() {
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Pressure,
            pressure_smoothing: 0.5,
            ..VelocityConfig::default()
        });
        vc.pressure_sample(1.0);
        assert!((vc.pressure() - 0.5).abs() < 1e-6);
        vc.pressure_sample(1.0);
        assert!((vc.pressure() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_position_rows_and_modifiers() {
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Position,
            ..VelocityConfig::default()
        });
        assert_eq!(vc.strike(0, Some(Row::Bottom), false, false, false).value, 40);
        assert_eq!(vc.strike(1, Some(Row::Home), false, false, false).value, 80);
        assert_eq!(vc.strike(2, Some(Row::Top), false, false, false).value, 110);
        assert_eq!(vc.strike(3, Some(Row::Top), false, true, false).value, 127);
        assert_eq!(vc.strike(4, Some(Row::Bottom), false, false, true).value, 20);
    }

    #[test]
    fn test_combined_prefers_pressure_only_while_touching() {
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Combined,
            curve: TimingCurve::Linear,
            ..VelocityConfig::default()
        });
        vc.pressure_sample(0.5);
        let touching = vc.strike(0, Some(Row::Home), true, false, false);
        assert_eq!(touching.source, VelocitySource::Pressure);

        let lifted = vc.strike(1, Some(Row::Home), false, false, false);
        assert_eq!(lifted.source, VelocitySource::Position);
        assert_eq!(lifted.value, 80);
    }

    #[test]
    fn test_combined_falls_back_to_timing_without_row() {
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Combined,
            ..VelocityConfig::default()
        });
        let info = vc.strike(0, None, false, false, false);
        assert_eq!(info.source, VelocitySource::Timing);
        assert_eq!(info.value, 80);
    }

    #[test]
    fn test_fixed_mode() {
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Fixed,
            fixed: 99,
            ..VelocityConfig::default()
        });
        assert_eq!(vc.strike(0, None, false, false, false).value, 99);
    }

    #[test]
    fn test_velocity_never_zero() {
        // Worst cases across sources: zero pressure, ctrl on the quiet row
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Pressure,
            ..VelocityConfig::default()
        });
        assert!(vc.strike(0, None, true, false, false).value >= 1);

        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Position,
            row_bottom: 10,
            ..VelocityConfig::default()
        });
        assert!(vc.strike(0, Some(Row::Bottom), false, false, true).value >= 1);
    }
}
