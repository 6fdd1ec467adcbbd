//! Camera feature controls.
//!
//! The register-level protocol lives behind [`CameraControl`]; this crate only
//! forwards unsigned values and never converts units.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use std::fmt;

use crate::Result;

/// Camera features exposed by a capture session.
///
/// Discriminants are the IIDC feature identifiers.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Feature {
    Brightness = 416,
    Exposure = 417,
    Shutter = 423,
    Gain = 424,
    Iris = 425,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::Brightness,
        Feature::Exposure,
        Feature::Shutter,
        Feature::Gain,
        Feature::Iris,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Feature::Brightness => "brightness",
            Feature::Exposure => "exposure",
            Feature::Shutter => "shutter",
            Feature::Gain => "gain",
            Feature::Iris => "iris",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Initial value of a feature applied when a session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Setting {
    /// Let the camera regulate the feature.
    #[default]
    Auto,
    /// Fix the feature at a raw register value.
    Manual(u32),
}

impl From<i32> for Setting {
    /// Negative values (conventionally `-1`) mean automatic.
    fn from(value: i32) -> Self {
        u32::try_from(value).map_or(Setting::Auto, Setting::Manual)
    }
}

/// Register-level access to one camera's features.
///
/// Implementations report [`Error::ControlRejected`](crate::Error::ControlRejected)
/// for out-of-range values and [`Error::ControlFailed`](crate::Error::ControlFailed)
/// when the camera cannot be reached.
pub trait CameraControl: Send {
    fn get(&self, feature: Feature) -> Result<u32>;

    fn set(&mut self, feature: Feature, value: u32) -> Result<()>;

    /// Switch `feature` to automatic regulation.
    fn set_auto(&mut self, feature: Feature) -> Result<()>;
}

pub(crate) fn apply(
    control: &mut dyn CameraControl,
    feature: Feature,
    setting: Setting,
) -> Result<()> {
    match setting {
        Setting::Auto => control.set_auto(feature),
        Setting::Manual(value) => control.set(feature, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_from_signed() {
        assert_eq!(Setting::from(-1), Setting::Auto);
        assert_eq!(Setting::from(i32::MIN), Setting::Auto);
        assert_eq!(Setting::from(0), Setting::Manual(0));
        assert_eq!(Setting::from(200), Setting::Manual(200));
    }

    #[test]
    fn test_feature_ids() {
        assert_eq!(u32::from(Feature::Brightness), 416);
        assert_eq!(Feature::try_from(424u32).unwrap(), Feature::Gain);
        assert!(Feature::try_from(418u32).is_err());
        assert_eq!(Feature::Iris.to_string(), "iris");
    }
}
