use std::sync::Arc;

use anyhow::{Context, Result};
use nvml_wrapper::{
    Device, Nvml, enum_wrappers::device::TemperatureSensor,
    enums::device::FanControlPolicy, error::NvmlError,
};
use tracing::{debug, trace};

use crate::{
    errors::{ControlError, SensorError},
    sensor::{GpuVendor, SensorSource},
};

// NVIDIA GPU driven through NVML
pub struct NvidiaDevice {
    // NVML is thread-safe so it is safe to make
    // simultaneous NVML calls from multiple threads.
    // We can therefore simply share it in an Arc with no Mutex
    nvml: Arc<Nvml>,

    // Store the GPU unique identifier
    uuid: String,
    name: String,

    // Store the number of fan on the GPU
    fan_count: u32,
}

impl NvidiaDevice {
    pub fn new(nvml: &Arc<Nvml>, uuid: &str) -> Result<Self> {
        let device = nvml.device_by_uuid(uuid).with_context(|| {
            format!("Failed to retrive GPU device \"{}\"", uuid)
        })?;

        let name = device
            .name()
            .with_context(|| format!("Failed to retrive name of \"{}\"", uuid))?;

        // A GPU without fans is still monitored, it just can't be controlled
        let fan_count = device.num_fans().unwrap_or(0);

        debug!("NVIDIA device \"{}\" ({}) has {} fans", name, uuid, fan_count);

        Ok(Self {
            nvml: nvml.clone(),
            uuid: uuid.to_string(),
            name,
            fan_count,
        })
    }

    // Return a NVML device handle.
    // The handle is looked up on every call, a GPU that fell
    // off the bus shows up as an error here
    fn get(&self) -> std::result::Result<Device<'_>, NvmlError> {
        self.nvml.device_by_uuid(self.uuid.as_str())
    }

    fn read_error(&self, what: &'static str, err: NvmlError) -> SensorError {
        SensorError::Read {
            unit: self.uuid.clone(),
            what,
            reason: err.to_string(),
        }
    }

    fn control_error(&self, err: NvmlError) -> ControlError {
        match err {
            NvmlError::NotSupported => ControlError::NoControllableFan {
                unit: self.uuid.clone(),
            },
            err => ControlError::Rejected {
                unit: self.uuid.clone(),
                reason: err.to_string(),
            },
        }
    }

    // Utility to execute a function for all fan on the GPU
    fn for_each_fan(
        &self,
        mut f: impl FnMut(&mut Device<'_>, u32) -> std::result::Result<(), NvmlError>,
    ) -> std::result::Result<(), ControlError> {
        if self.fan_count == 0 {
            return Err(ControlError::NoControllableFan {
                unit: self.uuid.clone(),
            });
        }

        let mut device = self.get().map_err(|_| ControlError::Unavailable {
            unit: self.uuid.clone(),
        })?;

        for i in 0..self.fan_count {
            f(&mut device, i).map_err(|e| self.control_error(e))?;
        }

        Ok(())
    }
}

impl SensorSource for NvidiaDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Nvidia
    }

    fn id(&self) -> String {
        self.uuid.clone()
    }

    fn is_available(&self) -> bool {
        self.get().is_ok()
    }

    fn has_fan_control(&self) -> bool {
        self.fan_count > 0
    }

    fn read_temperature(&self) -> std::result::Result<f32, SensorError> {
        let device = self.get().map_err(|_| SensorError::Unavailable {
            unit: self.uuid.clone(),
        })?;

        match device.temperature(TemperatureSensor::Gpu) {
            Ok(temp) => Ok(temp as f32),
            // No GPU temperature sensor on this board
            Err(NvmlError::NotSupported) => Ok(0.),
            Err(err) => Err(self.read_error("temperature", err)),
        }
    }

    fn read_fan_duty(&self) -> std::result::Result<f32, SensorError> {
        if self.fan_count == 0 {
            return Ok(0.);
        }

        let device = self.get().map_err(|_| SensorError::Unavailable {
            unit: self.uuid.clone(),
        })?;

        match device.fan_speed(0) {
            Ok(speed) => Ok(speed as f32),
            Err(NvmlError::NotSupported) => Ok(0.),
            Err(err) => Err(self.read_error("fan duty", err)),
        }
    }

    fn read_fan_rpm(&self) -> std::result::Result<f32, SensorError> {
        if self.fan_count == 0 {
            return Ok(0.);
        }

        let device = self.get().map_err(|_| SensorError::Unavailable {
            unit: self.uuid.clone(),
        })?;

        match device.fan_speed_rpm(0) {
            Ok(rpm) => Ok(rpm as f32),
            Err(NvmlError::NotSupported) => Ok(0.),
            Err(err) => Err(self.read_error("fan rpm", err)),
        }
    }

    fn set_duty(&self, percent: u8) -> std::result::Result<(), ControlError> {
        let percent = percent.min(100) as u32;

        trace!("Setting fan duty of \"{}\" to {}%", self.uuid, percent);

        // Apply the fan speed to all fans
        self.for_each_fan(|dev, i| dev.set_fan_speed(i, percent))
    }

    fn release_to_automatic(&self) -> std::result::Result<(), ControlError> {
        trace!("Setting control policy to auto for \"{}\"", self.uuid);

        self.for_each_fan(|dev, i| {
            dev.set_fan_control_policy(i, FanControlPolicy::TemperatureContinousSw)
        })
    }
}

// Discover Nvidia GPUs on the system, the devices
// are returned in NVML index order
pub fn discover_nvidia_gpus(nvml: &Arc<Nvml>) -> Result<Vec<NvidiaDevice>> {
    let device_count = nvml
        .device_count()
        .with_context(|| "Failed to count NVML devices")?;

    let mut devices = Vec::with_capacity(device_count as usize);

    for i in 0..device_count {
        // Get the UUID of each device
        let device = nvml.device_by_index(i)?;
        let uuid = device.uuid()?;

        debug!("Found Nvidia device: \"{}\"", uuid);

        devices.push(NvidiaDevice::new(nvml, &uuid)?);
    }

    Ok(devices)
}
