// amdgpu hwmon: temp1_input (m°C), pwm1 (0..=255), pwm1_enable (1 manual,
// 2 automatic), fan1_input (RPM)

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, trace, warn};

use crate::{
    errors::{ControlError, SensorError},
    sensor::{GpuVendor, SensorSource},
};

pub const DRM_PATH: &str = "/sys/class/drm";
pub const AMD_VENDOR_ID: &str = "0x1002";

const MILLIDEGREE_DIVISOR: f32 = 1000.;

const TEMP_INPUT: &str = "temp1_input";
const PWM: &str = "pwm1";
const PWM_ENABLE: &str = "pwm1_enable";
const FAN_INPUT: &str = "fan1_input";

const PWM_MANUAL: &str = "1";
const PWM_AUTOMATIC: &str = "2";

// Convert a percentage (0-100) to a PWM value (0-255)
fn pwm_from_percent(percent: u8) -> u8 {
    ((percent.min(100) as f32 / 100.) * 255.).round() as u8
}

// Convert a PWM value (0-255) to a percentage (0-100)
fn pwm_to_percent(value: u8) -> f32 {
    (value as f32 / 255.) * 100.
}

pub struct HwmonDevice {
    // DRM card name, e.g. "card1"
    card: String,
    name: String,

    hwmon_path: PathBuf,
}

impl HwmonDevice {
    pub fn new(card: &str, device_path: &Path, hwmon_path: PathBuf) -> Self {
        Self {
            card: card.to_string(),
            name: read_gpu_name(device_path),
            hwmon_path,
        }
    }

    // Read an integer attribute, a missing file is reported as None
    fn read_attr(
        &self,
        file: &str,
        what: &'static str,
    ) -> Result<Option<i64>, SensorError> {
        let path = self.hwmon_path.join(file);

        if !self.hwmon_path.exists() {
            return Err(SensorError::Unavailable {
                unit: self.card.clone(),
            });
        }

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SensorError::Read {
                    unit: self.card.clone(),
                    what,
                    reason: err.to_string(),
                });
            }
        };

        raw.trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|err| SensorError::Read {
                unit: self.card.clone(),
                what,
                reason: format!("invalid value {:?} in {}: {}", raw.trim(), file, err),
            })
    }

    fn write_attr(&self, file: &str, value: &str) -> Result<(), ControlError> {
        let path = self.hwmon_path.join(file);

        trace!("Writing {:?} to {:?}", value, path);

        fs::write(&path, value).map_err(|err| ControlError::Rejected {
            unit: self.card.clone(),
            reason: format!("failed to write {}: {}", file, err),
        })
    }

    fn ensure_controllable(&self) -> Result<(), ControlError> {
        if !self.hwmon_path.exists() {
            return Err(ControlError::Unavailable {
                unit: self.card.clone(),
            });
        }

        if !self.has_fan_control() {
            return Err(ControlError::NoControllableFan {
                unit: self.card.clone(),
            });
        }

        Ok(())
    }
}

impl SensorSource for HwmonDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Amd
    }

    fn id(&self) -> String {
        self.card.clone()
    }

    fn is_available(&self) -> bool {
        self.hwmon_path.is_dir()
    }

    fn has_fan_control(&self) -> bool {
        self.hwmon_path.join(PWM).exists()
    }

    fn read_temperature(&self) -> Result<f32, SensorError> {
        let millidegrees = self.read_attr(TEMP_INPUT, "temperature")?;

        Ok(millidegrees.map_or(0., |m| m as f32 / MILLIDEGREE_DIVISOR))
    }

    fn read_fan_duty(&self) -> Result<f32, SensorError> {
        let pwm = self.read_attr(PWM, "fan duty")?;

        Ok(pwm.map_or(0., |v| pwm_to_percent(v.clamp(0, 255) as u8)))
    }

    fn read_fan_rpm(&self) -> Result<f32, SensorError> {
        let rpm = self.read_attr(FAN_INPUT, "fan rpm")?;

        Ok(rpm.map_or(0., |v| v.max(0) as f32))
    }

    fn set_duty(&self, percent: u8) -> Result<(), ControlError> {
        self.ensure_controllable()?;

        // Take the fan away from the firmware before writing the duty
        if self.hwmon_path.join(PWM_ENABLE).exists() {
            self.write_attr(PWM_ENABLE, PWM_MANUAL)?;
        }

        let pwm = pwm_from_percent(percent);
        self.write_attr(PWM, &pwm.to_string())?;

        debug!("Set {} fan to {}% (PWM: {})", self.card, percent, pwm);

        Ok(())
    }

    fn release_to_automatic(&self) -> Result<(), ControlError> {
        self.ensure_controllable()?;

        if !self.hwmon_path.join(PWM_ENABLE).exists() {
            return Err(ControlError::NoControllableFan {
                unit: self.card.clone(),
            });
        }

        self.write_attr(PWM_ENABLE, PWM_AUTOMATIC)
    }
}

fn read_gpu_name(device_path: &Path) -> String {
    if let Ok(name) = fs::read_to_string(device_path.join("product_name")) {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }

    "AMD GPU".to_string()
}

fn is_amd_gpu(device_path: &Path) -> bool {
    fs::read_to_string(device_path.join("vendor"))
        .map(|id| id.trim() == AMD_VENDOR_ID)
        .unwrap_or(false)
}

fn find_hwmon(device_path: &Path) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(device_path.join("hwmon"))
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();

    dirs.sort();
    dirs.into_iter().next()
}

// Card number of a "cardN" entry, connector entries like "card0-DP-1" are skipped
fn card_number(name: &str) -> Option<u32> {
    name.strip_prefix("card")?.parse().ok()
}

// Discover the AMD GPUs under the given DRM directory,
// ordered by card number so indices are stable between runs
pub fn discover_amd_gpus(drm_path: &Path) -> Vec<HwmonDevice> {
    let entries = match fs::read_dir(drm_path) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("Cannot read {:?}: {}", drm_path, err);
            return Vec::new();
        }
    };

    let mut cards: Vec<(u32, String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let number = card_number(&name)?;

            Some((number, name, entry.path().join("device")))
        })
        .collect();

    cards.sort_by_key(|(number, _, _)| *number);

    let mut devices = Vec::new();

    for (_, card, device_path) in cards {
        if !is_amd_gpu(&device_path) {
            continue;
        }

        let Some(hwmon_path) = find_hwmon(&device_path) else {
            warn!("AMD GPU {} has no hwmon directory, skipping it", card);
            continue;
        };

        debug!("Found AMD device: \"{}\" at {:?}", card, hwmon_path);

        devices.push(HwmonDevice::new(&card, &device_path, hwmon_path));
    }

    devices
}
