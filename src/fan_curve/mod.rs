pub mod fan_mode;
pub mod hysteresis;
pub mod linear_curve;
pub mod presets;

pub use fan_mode::FanMode;
pub use hysteresis::{HysteresisGate, HysteresisThresholds};
pub use linear_curve::{Curve, CurvePoint, DEFAULT_DUTY};
