// Default minimum duty change that triggers a new fan command
pub const DEFAULT_DUTY_THRESHOLD: u8 = 5;
// Default minimum temperature change that triggers a new fan command
pub const DEFAULT_TEMPERATURE_THRESHOLD: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisThresholds {
    // Absolute duty delta, in percentage points
    pub duty: u8,
    // Absolute temperature delta, in °C
    pub temperature: f32,
}

impl Default for HysteresisThresholds {
    fn default() -> Self {
        Self {
            duty: DEFAULT_DUTY_THRESHOLD,
            temperature: DEFAULT_TEMPERATURE_THRESHOLD,
        }
    }
}

// Compares against the last *applied* command, empty until the first one
#[derive(Debug, Clone)]
pub struct HysteresisGate {
    thresholds: HysteresisThresholds,

    // Store the temperature and duty of the last applied command
    last_update: Option<(f32, u8)>,
}

impl HysteresisGate {
    pub fn new(thresholds: HysteresisThresholds) -> Self {
        Self {
            thresholds,
            last_update: None,
        }
    }

    // Return true if a command for the target duty should be issued
    pub fn should_update(&self, temperature: f32, target_duty: u8) -> bool {
        let Some((last_temp, last_duty)) = self.last_update else {
            return true;
        };

        let duty_delta = (target_duty as i16 - last_duty as i16).unsigned_abs();
        let temp_delta = (temperature - last_temp).abs();

        duty_delta >= self.thresholds.duty as u16
            || temp_delta >= self.thresholds.temperature
    }

    // Remember a command that was successfully applied
    pub fn record(&mut self, temperature: f32, duty: u8) {
        self.last_update = Some((temperature, duty));
    }

    pub fn last_temperature(&self) -> Option<f32> {
        self.last_update.map(|(t, _)| t)
    }

    pub fn last_duty(&self) -> Option<u8> {
        self.last_update.map(|(_, d)| d)
    }

    pub fn thresholds(&self) -> HysteresisThresholds {
        self.thresholds
    }
}
