// Shared test doubles for the sensor layer

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crate::{
    errors::{ControlError, SensorError},
    sensor::{GpuVendor, SensorSource},
};

// Scripted sensor source.
// Temperatures are served from a queue, the last one repeats forever
pub struct FakeSource {
    name: String,

    temperatures: Mutex<VecDeque<f32>>,
    last_temperature: Mutex<f32>,

    pub available: AtomicBool,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,

    pub reads: AtomicUsize,
    pub releases: AtomicUsize,
    commands: Mutex<Vec<u8>>,
}

impl FakeSource {
    pub fn new(name: &str, temperatures: &[f32]) -> Self {
        Self {
            name: name.to_string(),
            temperatures: Mutex::new(temperatures.iter().copied().collect()),
            last_temperature: Mutex::new(0.),
            available: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn push_temperatures(&self, temperatures: &[f32]) {
        self.temperatures
            .lock()
            .unwrap()
            .extend(temperatures.iter().copied());
    }

    // Every duty passed to a successful set_duty call
    pub fn commands(&self) -> Vec<u8> {
        self.commands.lock().unwrap().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl SensorSource for FakeSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Unknown
    }

    fn id(&self) -> String {
        format!("fake:{}", self.name)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn has_fan_control(&self) -> bool {
        true
    }

    fn read_temperature(&self) -> Result<f32, SensorError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SensorError::Read {
                unit: self.name.clone(),
                what: "temperature",
                reason: "scripted failure".to_string(),
            });
        }

        let mut last = self.last_temperature.lock().unwrap();
        if let Some(next) = self.temperatures.lock().unwrap().pop_front() {
            *last = next;
        }

        Ok(*last)
    }

    fn read_fan_duty(&self) -> Result<f32, SensorError> {
        Ok(self.commands().last().copied().unwrap_or(0) as f32)
    }

    fn read_fan_rpm(&self) -> Result<f32, SensorError> {
        Ok(self.commands().last().copied().unwrap_or(0) as f32 * 30.)
    }

    fn set_duty(&self, percent: u8) -> Result<(), ControlError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ControlError::Rejected {
                unit: self.name.clone(),
                reason: "scripted failure".to_string(),
            });
        }

        self.commands.lock().unwrap().push(percent);

        Ok(())
    }

    fn release_to_automatic(&self) -> Result<(), ControlError> {
        self.releases.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }
}
