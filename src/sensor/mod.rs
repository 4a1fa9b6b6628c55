use std::fmt;

use serde::Serialize;

use crate::errors::{ControlError, SensorError};

pub mod hwmon;
pub mod nvidia;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Unknown,
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nvidia => "NVIDIA",
            Self::Amd => "AMD",
            Self::Intel => "Intel",
            Self::Unknown => "Unknown",
        };

        f.write_str(name)
    }
}

// Static description of a discovered unit.
// The index is assigned once at discovery and never changes afterwards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitInfo {
    pub index: usize,
    pub name: String,
    pub vendor: GpuVendor,

    // Backend specific identifier (NVML UUID, DRM card name)
    pub id: String,
}

impl fmt::Display for UnitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.index, self.name, self.vendor)
    }
}

// One poll of a unit. Recomputed on every query, never cached
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorReading {
    pub unit: usize,

    pub temperature: f32,
    pub fan_duty: f32,
    pub fan_rpm: f32,

    pub available: bool,
}

impl SensorReading {
    pub fn unavailable(unit: usize) -> Self {
        Self {
            unit,
            ..Default::default()
        }
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.available {
            return write!(f, "GPU {}: not available", self.unit);
        }

        write!(
            f,
            "GPU {}: {:.1}°C, {:.0}% ({:.0} RPM)",
            self.unit, self.temperature, self.fan_duty, self.fan_rpm
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanControlStatus {
    Available,
    // No writable fan on a GPU whose name looks like a laptop part
    LockedByManufacturer,
    NotExposed,
    Unavailable,
}

impl fmt::Display for FanControlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Available => "Full fan control available",
            Self::LockedByManufacturer => {
                "Laptop GPU - fan control typically locked by manufacturer"
            }
            Self::NotExposed => "GPU does not expose fan control",
            Self::Unavailable => "GPU not available",
        };

        f.write_str(msg)
    }
}

// Calls may block on driver or sysfs I/O
#[cfg_attr(test, mockall::automock)]
pub trait SensorSource: Send + Sync {
    fn name(&self) -> String;
    fn vendor(&self) -> GpuVendor;
    // Backend specific identifier
    fn id(&self) -> String;

    fn is_available(&self) -> bool;
    // True if the unit exposes a writable fan
    fn has_fan_control(&self) -> bool;

    // Current temperature in °C. Returns 0 when the unit has
    // no temperature sensor, read failures are errors
    fn read_temperature(&self) -> Result<f32, SensorError>;
    // Current fan duty in percent, 0 without a fan sensor
    fn read_fan_duty(&self) -> Result<f32, SensorError>;
    // Current fan speed in RPM, 0 without a tachometer
    fn read_fan_rpm(&self) -> Result<f32, SensorError>;

    // Command every fan of the unit to the given duty (0..=100)
    fn set_duty(&self, percent: u8) -> Result<(), ControlError>;
    // Hand fan control back to the driver or firmware
    fn release_to_automatic(&self) -> Result<(), ControlError>;
}

// Name based guess of a laptop GPU, whose fan is usually
// owned by the embedded controller rather than the GPU driver
pub fn is_laptop_gpu(name: &str) -> bool {
    let name = name.to_lowercase();

    ["mobile", "laptop", "max-q", "max-p", "notebook", "m ", " m)"]
        .iter()
        .any(|hint| name.contains(hint))
}

// Describe what kind of fan control a unit offers
pub fn fan_control_status(source: &dyn SensorSource) -> FanControlStatus {
    if !source.is_available() {
        FanControlStatus::Unavailable
    } else if source.has_fan_control() {
        FanControlStatus::Available
    } else if is_laptop_gpu(&source.name()) {
        FanControlStatus::LockedByManufacturer
    } else {
        FanControlStatus::NotExposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn laptop_names() {
        assert!(is_laptop_gpu("NVIDIA GeForce RTX 3070 Laptop GPU"));
        assert!(is_laptop_gpu("GeForce GTX 1060 with Max-Q Design"));
        assert!(is_laptop_gpu("Radeon RX 6800M Mobile"));
        assert!(is_laptop_gpu("Quadro T1000 (Turing M)"));
        assert!(is_laptop_gpu("Radeon 680M Graphics"));

        assert!(!is_laptop_gpu("NVIDIA GeForce RTX 4090"));
        assert!(!is_laptop_gpu("AMD Radeon RX 7900 XTX"));
        assert!(!is_laptop_gpu("GeForce GTX 1660 SUPER"));
    }

    #[test]
    fn control_status_prefers_availability() {
        let mut source = MockSensorSource::new();
        source.expect_is_available().return_const(false);

        assert_eq!(fan_control_status(&source), FanControlStatus::Unavailable);
    }

    #[test]
    fn control_status_for_locked_laptop() {
        let mut source = MockSensorSource::new();
        source.expect_is_available().return_const(true);
        source.expect_has_fan_control().return_const(false);
        source
            .expect_name()
            .returning(|| "GeForce RTX 4060 Laptop GPU".to_string());

        assert_eq!(
            fan_control_status(&source),
            FanControlStatus::LockedByManufacturer
        );
    }

    #[test]
    fn control_status_for_desktop_without_fan() {
        let mut source = MockSensorSource::new();
        source.expect_is_available().return_const(true);
        source.expect_has_fan_control().return_const(false);
        source
            .expect_name()
            .returning(|| "Tesla T4".to_string());

        assert_eq!(fan_control_status(&source), FanControlStatus::NotExposed);
    }

    #[test]
    fn reading_display() {
        let reading = SensorReading {
            unit: 1,
            temperature: 64.26,
            fan_duty: 47.,
            fan_rpm: 1510.,
            available: true,
        };

        assert_eq!(reading.to_string(), "GPU 1: 64.3°C, 47% (1510 RPM)");
        assert_eq!(
            SensorReading::unavailable(2).to_string(),
            "GPU 2: not available"
        );
    }
}
