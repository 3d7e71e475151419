//! Device classification by capability inspection
//!
//! Devices are classified by what they can emit, never by their name: a
//! keyboard advertises the letter keys and space, a touchpad advertises
//! absolute X/Y plus a touch button. Anything else is ignored. External
//! MIDI ports come in through `tangent-midi` and never pass through here.

use evdev::{AbsoluteAxisType, Device, Key};

/// What kind of instrument surface a device is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Keyboard,
    Touchpad,
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceClass::Keyboard => write!(f, "keyboard"),
            DeviceClass::Touchpad => write!(f, "touchpad"),
        }
    }
}

/// Classify a device, or `None` for devices we ignore.
pub fn classify(device: &Device) -> Option<DeviceClass> {
    let keys = device.supported_keys();

    if let Some(keys) = keys {
        let has_letters =
            keys.contains(Key::KEY_Q) && keys.contains(Key::KEY_A) && keys.contains(Key::KEY_Z);
        if has_letters && keys.contains(Key::KEY_SPACE) {
            return Some(DeviceClass::Keyboard);
        }
    }

    if let Some(axes) = device.supported_absolute_axes() {
        let has_x = axes.contains(AbsoluteAxisType::ABS_X)
            || axes.contains(AbsoluteAxisType::ABS_MT_POSITION_X);
        let has_y = axes.contains(AbsoluteAxisType::ABS_Y)
            || axes.contains(AbsoluteAxisType::ABS_MT_POSITION_Y);
        let has_touch_button = keys.map_or(false, |keys| keys.contains(Key::BTN_TOUCH));
        if has_x && has_y && has_touch_button {
            return Some(DeviceClass::Touchpad);
        }
    }

    None
}

/// Raw axis ranges read from the device at open time.
#[derive(Debug, Clone, Copy)]
pub struct AxisCalibration {
    pub x: (i32, i32),
    pub y: (i32, i32),
    pub pressure: (i32, i32),
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self {
            x: (0, 1),
            y: (0, 1),
            pressure: (0, 1),
        }
    }
}

impl AxisCalibration {
    /// Read min/max for the position and pressure axes, preferring the
    /// multitouch variants when they carry a real range.
    pub fn probe(device: &Device) -> Self {
        let mut calibration = Self::default();
        let Ok(abs) = device.get_abs_state() else {
            return calibration;
        };
        let range = |axis: AbsoluteAxisType| -> Option<(i32, i32)> {
            let info = abs[axis.0 as usize];
            (info.maximum > info.minimum).then_some((info.minimum, info.maximum))
        };
        calibration.x = range(AbsoluteAxisType::ABS_MT_POSITION_X)
            .or_else(|| range(AbsoluteAxisType::ABS_X))
            .unwrap_or(calibration.x);
        calibration.y = range(AbsoluteAxisType::ABS_MT_POSITION_Y)
            .or_else(|| range(AbsoluteAxisType::ABS_Y))
            .unwrap_or(calibration.y);
        calibration.pressure = range(AbsoluteAxisType::ABS_MT_PRESSURE)
            .or_else(|| range(AbsoluteAxisType::ABS_PRESSURE))
            .unwrap_or(calibration.pressure);
        calibration
    }

    /// Normalize a raw sample into [0, 1]; degenerate ranges center.
    pub fn normalize(range: (i32, i32), value: i32) -> f32 {
        let (min, max) = range;
        if max == min {
            return 0.5;
        }
        ((value - min) as f32 / (max - min) as f32).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_maps_range() {
        assert_eq!(AxisCalibration::normalize((0, 100), 50), 0.5);
        assert_eq!(AxisCalibration::normalize((0, 100), 0), 0.0);
        assert_eq!(AxisCalibration::normalize((0, 100), 100), 1.0);
    }

    #[test]
    fn test_normalize_clamps_out_of_range() {
        assert_eq!(AxisCalibration::normalize((0, 100), -5), 0.0);
        assert_eq!(AxisCalibration::normalize((0, 100), 200), 1.0);
    }

    #[test]
    fn test_normalize_degenerate_range_centers() {
        assert_eq!(AxisCalibration::normalize((3, 3), 3), 0.5);
    }
}
