use std::fmt;

// Unit fan mode as tracked by the devices manager
#[derive(Debug, Clone, PartialEq)]
pub enum FanMode {
    // The driver or firmware owns the fan
    Auto,
    // An auto controller follows the named curve
    Curve(String),

    Manual(u8),
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "automatic"),
            Self::Curve(name) => write!(f, "curve \"{name}\""),
            Self::Manual(duty) => write!(f, "manual {duty}%"),
        }
    }
}
