use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Result, anyhow};
use nvml_wrapper::Nvml;
use thiserror::Error;
use tokio::{
    select,
    sync::{
        broadcast,
        mpsc::{Receiver, Sender},
        oneshot,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    auto_controller::{AdjustmentEvent, AutoController, ControllerSettings},
    errors::{ControlError, SensorError},
    fan_curve::{Curve, FanMode},
    sensor::{
        self, FanControlStatus, SensorReading, SensorSource, UnitInfo,
        hwmon::{DRM_PATH, discover_amd_gpus},
        nvidia::discover_nvidia_gpus,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

const LAPTOP_HINT: &str =
    " (likely a laptop GPU with fan control locked by the manufacturer)";

type Responder = oneshot::Sender<DevicesAnswer>;

#[derive(Debug, Error)]
pub enum DevicesManagerError {
    #[error("Fan duty {0}% is outside of 0..=100")]
    InvalidDuty(i32),
    #[error("No unit with index {0}")]
    UnknownUnit(usize),
    #[error("Failed to read unit {unit}: {source}")]
    Sensor {
        unit: usize,
        #[source]
        source: SensorError,
    },
    #[error("Fan control failed on unit {unit}: {source}{hint}")]
    Control {
        unit: usize,
        #[source]
        source: ControlError,
        // Empty unless the unit name looks like a laptop GPU
        hint: &'static str,
    },
    #[error("The devices manager has been disposed")]
    Disposed,
}

impl DevicesManagerError {
    // True if the unit is most likely a laptop GPU with locked fans
    pub fn is_locked_laptop(&self) -> bool {
        matches!(self, Self::Control { hint, .. } if !hint.is_empty())
    }
}

// Requests served by the devices manager run loop
pub enum DevicesMessage {
    ListUnits { tx: Responder },
    GetStatus { unit: usize, tx: Responder },
    GetFanMode { unit: usize, tx: Responder },

    SetManual { unit: usize, duty: i32, tx: Responder },
    StartAuto { unit: usize, curve: Curve, tx: Responder },
    StopAuto { unit: usize, tx: Responder },
    ResetAllToAuto { tx: Responder },
}

#[derive(Debug)]
pub enum DevicesAnswer {
    Units(Vec<UnitInfo>),
    Status(SensorReading),
    FanMode(Option<FanMode>),

    Done(Result<(), DevicesManagerError>),
}

struct Unit {
    info: UnitInfo,
    source: Arc<dyn SensorSource>,

    mode: FanMode,
}

// Indices follow discovery order, at most one auto controller per unit
pub struct DevicesManager {
    units: Vec<Unit>,

    // Keyed by unit index
    controllers: HashMap<usize, AutoController>,

    tx_event: broadcast::Sender<AdjustmentEvent>,
    settings: ControllerSettings,

    disposed: bool,
}

impl DevicesManager {
    // Discover the NVIDIA and AMD GPUs of the system
    pub fn new(settings: ControllerSettings) -> Self {
        let mut sources: Vec<Arc<dyn SensorSource>> = Vec::new();

        // Attempt to initialize NVML
        match Nvml::init() {
            Ok(nvml) => {
                info!("NVML successfully initialized");

                let nvml = Arc::new(nvml);

                match discover_nvidia_gpus(&nvml) {
                    Ok(devices) => sources.extend(
                        devices
                            .into_iter()
                            .map(|d| Arc::new(d) as Arc<dyn SensorSource>),
                    ),
                    Err(e) => {
                        warn!("Error during Nvidia GPUs discovery: {}", e);

                        e.chain().for_each(|e| {
                            debug!("Error chain: {}", e);
                        });
                    }
                }
            }
            Err(e) => debug!("NVML not available: {}", e),
        }

        sources.extend(
            discover_amd_gpus(Path::new(DRM_PATH))
                .into_iter()
                .map(|d| Arc::new(d) as Arc<dyn SensorSource>),
        );

        Self::from_sources(sources, settings)
    }

    // Build a manager over already discovered sources,
    // indices follow the order of the given vector
    pub fn from_sources(
        sources: Vec<Arc<dyn SensorSource>>,
        settings: ControllerSettings,
    ) -> Self {
        let units: Vec<Unit> = sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| Unit {
                info: UnitInfo {
                    index,
                    name: source.name(),
                    vendor: source.vendor(),
                    id: source.id(),
                },
                source,
                mode: FanMode::Auto,
            })
            .collect();

        for unit in &units {
            info!("Unit {}", unit.info);
        }

        let (tx_event, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            units,
            controllers: HashMap::new(),
            tx_event,
            settings,
            disposed: false,
        }
    }

    // Run the devices manager
    pub async fn run(
        &mut self,
        run_token: CancellationToken,
        mut rx_message: Receiver<DevicesMessage>,
        tx_err: Sender<anyhow::Error>,
    ) {
        info!("Devices manager: Running");

        loop {
            select! {
                _ = run_token.cancelled() => {
                    info!("Devices manager: Quiting");

                    self.dispose().await;

                    break;
                },
                message = rx_message.recv() => {
                    let Some(message) = message else {
                        warn!("Devices manager: message channel closed");

                        run_token.cancelled().await;
                        continue;
                    };

                    if let Err(err) = self.parse_message(message).await {
                        tx_err.send(err).await.unwrap_or_else(|err| {
                            error!("Failed to send error over channel: {err}");
                        });
                    }
                }
            }
        }
    }

    // Parse the receive message and answer it
    async fn parse_message(&mut self, message: DevicesMessage) -> Result<()> {
        let (tx, answer) = match message {
            DevicesMessage::ListUnits { tx } => {
                (tx, DevicesAnswer::Units(self.discover()))
            }
            DevicesMessage::GetStatus { unit, tx } => {
                (tx, DevicesAnswer::Status(self.status(unit)))
            }
            DevicesMessage::GetFanMode { unit, tx } => {
                (tx, DevicesAnswer::FanMode(self.fan_mode(unit)))
            }
            DevicesMessage::SetManual { unit, duty, tx } => {
                (tx, DevicesAnswer::Done(self.set_manual(unit, duty).await))
            }
            DevicesMessage::StartAuto { unit, curve, tx } => {
                (tx, DevicesAnswer::Done(self.start_auto(unit, curve).await))
            }
            DevicesMessage::StopAuto { unit, tx } => {
                (tx, DevicesAnswer::Done(self.stop_auto(unit).await))
            }
            DevicesMessage::ResetAllToAuto { tx } => {
                self.reset_all_to_auto().await;

                (tx, DevicesAnswer::Done(Ok(())))
            }
        };

        trace!("Devices manager answer: {:?}", answer);

        tx.send(answer)
            .map_err(|v| anyhow!("Failed to send answer to channel: {v:?}"))?;

        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdjustmentEvent> {
        self.tx_event.subscribe()
    }

    // Return the discovered units, in index order
    pub fn discover(&self) -> Vec<UnitInfo> {
        self.units.iter().map(|u| u.info.clone()).collect()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn unit(&self, index: usize) -> Result<&Unit, DevicesManagerError> {
        if self.disposed {
            return Err(DevicesManagerError::Disposed);
        }

        self.units
            .get(index)
            .ok_or(DevicesManagerError::UnknownUnit(index))
    }

    fn set_mode(&mut self, index: usize, mode: FanMode) {
        if let Some(unit) = self.units.get_mut(index) {
            debug!("Unit {} fan mode: {}", index, mode);
            unit.mode = mode;
        }
    }

    fn control_error(&self, index: usize, source: ControlError) -> DevicesManagerError {
        let locked = self
            .units
            .get(index)
            .is_some_and(|u| sensor::is_laptop_gpu(&u.info.name));

        DevicesManagerError::Control {
            unit: index,
            source,
            hint: if locked { LAPTOP_HINT } else { "" },
        }
    }

    // Poll a unit, read failures are returned to the caller
    pub fn read_status(&self, index: usize) -> Result<SensorReading, DevicesManagerError> {
        let source = &self.unit(index)?.source;
        let sensor_error = |err| DevicesManagerError::Sensor {
            unit: index,
            source: err,
        };

        if !source.is_available() {
            return Err(sensor_error(SensorError::Unavailable {
                unit: source.id(),
            }));
        }

        Ok(SensorReading {
            unit: index,
            temperature: source.read_temperature().map_err(sensor_error)?,
            fan_duty: source.read_fan_duty().map_err(sensor_error)?,
            fan_rpm: source.read_fan_rpm().map_err(sensor_error)?,
            available: true,
        })
    }

    // Poll a unit. Never fails: an unknown or unavailable unit is
    // reported as not available and failed reads as 0
    pub fn status(&self, index: usize) -> SensorReading {
        let Ok(unit) = self.unit(index) else {
            return SensorReading::unavailable(index);
        };

        let source = &unit.source;

        if !source.is_available() {
            return SensorReading::unavailable(index);
        }

        let or_zero = |value: Result<f32, SensorError>| {
            value.unwrap_or_else(|err| {
                warn!("{}", err);
                0.
            })
        };

        SensorReading {
            unit: index,
            temperature: or_zero(source.read_temperature()),
            fan_duty: or_zero(source.read_fan_duty()),
            fan_rpm: or_zero(source.read_fan_rpm()),
            available: true,
        }
    }

    pub fn status_all(&self) -> Vec<SensorReading> {
        (0..self.units.len()).map(|i| self.status(i)).collect()
    }

    pub fn fan_mode(&self, index: usize) -> Option<FanMode> {
        self.unit(index).ok().map(|u| u.mode.clone())
    }

    pub fn fan_control_status(&self, index: usize) -> FanControlStatus {
        match self.unit(index) {
            Ok(unit) => sensor::fan_control_status(unit.source.as_ref()),
            Err(_) => FanControlStatus::Unavailable,
        }
    }

    pub fn is_auto_running(&self, index: usize) -> bool {
        self.controllers
            .get(&index)
            .is_some_and(|c| c.is_running())
    }

    pub fn active_curve(&self, index: usize) -> Option<&Curve> {
        self.controllers
            .get(&index)
            .filter(|c| c.is_running())
            .map(|c| c.curve())
    }

    // Stop and drop the auto controller of a unit, if any
    async fn stop_controller(&mut self, index: usize) {
        if let Some(mut controller) = self.controllers.remove(&index) {
            controller.stop().await;
        }
    }

    // Set a fixed fan duty. Any auto controller on the unit is stopped first
    pub async fn set_manual(
        &mut self,
        index: usize,
        duty: i32,
    ) -> Result<(), DevicesManagerError> {
        if !(0..=100).contains(&duty) {
            return Err(DevicesManagerError::InvalidDuty(duty));
        }

        let source = self.unit(index)?.source.clone();

        self.stop_controller(index).await;

        if !source.is_available() {
            return Err(self.control_error(
                index,
                ControlError::Unavailable { unit: source.id() },
            ));
        }

        source
            .set_duty(duty as u8)
            .map_err(|e| self.control_error(index, e))?;

        info!("Unit {}: fan duty set to {}%", index, duty);
        self.set_mode(index, FanMode::Manual(duty as u8));

        Ok(())
    }

    // Follow the given curve on a unit, replacing any running controller
    pub async fn start_auto(
        &mut self,
        index: usize,
        curve: Curve,
    ) -> Result<(), DevicesManagerError> {
        let source = self.unit(index)?.source.clone();

        // The old controller must be gone before the new one ticks
        self.stop_controller(index).await;

        let name = curve.name().to_string();
        let mut controller = AutoController::new(
            index,
            curve,
            source,
            self.tx_event.clone(),
            self.settings,
        );

        controller.start();

        self.controllers.insert(index, controller);
        self.set_mode(index, FanMode::Curve(name));

        Ok(())
    }

    // Stop the auto controller of a unit and give the fan back to the driver
    pub async fn stop_auto(&mut self, index: usize) -> Result<(), DevicesManagerError> {
        let source = self.unit(index)?.source.clone();

        self.stop_controller(index).await;

        // Best effort, the hardware reset is advisory
        if let Err(err) = source.release_to_automatic() {
            debug!("Unit {}: release to automatic failed: {}", index, err);
        }

        self.set_mode(index, FanMode::Auto);

        Ok(())
    }

    // Stop every auto controller and give every fan back to the driver,
    // individual failures are ignored
    pub async fn reset_all_to_auto(&mut self) {
        let running: Vec<usize> = self.controllers.keys().copied().collect();

        for index in running {
            self.stop_controller(index).await;
        }

        for unit in self.units.iter_mut() {
            if let Err(err) = unit.source.release_to_automatic() {
                debug!(
                    "Unit {}: release to automatic failed: {}",
                    unit.info.index, err
                );
            }

            unit.mode = FanMode::Auto;
        }

        info!("All units reset to automatic fan control");
    }

    // Stop every controller and release every unit.
    // Safe to call more than once
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        self.reset_all_to_auto().await;

        // No controller task is alive anymore, the sources can go
        self.units.clear();
        self.disposed = true;

        info!("Devices manager disposed");
    }
}
