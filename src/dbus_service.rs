use anyhow::anyhow;
use thiserror::Error;
use tokio::{
    select,
    sync::{
        broadcast::{self, error::RecvError},
        mpsc::Sender,
        oneshot,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use zbus::{Connection, fdo, interface, object_server::SignalEmitter};

use crate::{
    auto_controller::AdjustmentEvent,
    config_manager::ConfigManager,
    devices_manager::{DevicesAnswer, DevicesMessage},
    fan_curve::presets,
    sensor::{SensorReading, UnitInfo},
};

const SERVICE_NAME: &str = "com.github.MossFan1";
const ROOT_PATH: &str = "/com/github/MossFan1";

type Result<T> = std::result::Result<T, DbusServiceError>;

#[derive(Debug, Error)]
pub enum DbusServiceError {
    #[error("DBus service manager TX error: {reason}")]
    TX {
        reason: String,
        error: anyhow::Error,
    },
    #[error("DBus service manager RX error: {reason}")]
    RX {
        reason: String,
        error: anyhow::Error,
    },
    #[error("DBus service invalid response error: {reason}")]
    InvalidResponse { reason: String },
    #[error("DBus service DBus connection error: {reason}")]
    DBusConnection {
        reason: String,
        error: anyhow::Error,
    },
    #[error("DBus service DBus object error: {reason}")]
    DBusObject {
        reason: String,
        error: anyhow::Error,
    },
}

impl From<DbusServiceError> for fdo::Error {
    fn from(err: DbusServiceError) -> Self {
        fdo::Error::Failed(err.to_string())
    }
}

fn unit_path(index: usize) -> String {
    format!("{ROOT_PATH}/Gpu{index}")
}

// Send a request to the devices manager and wait for its answer
async fn request(
    tx_devices: &Sender<DevicesMessage>,
    message: impl FnOnce(oneshot::Sender<DevicesAnswer>) -> DevicesMessage,
) -> Result<DevicesAnswer> {
    let (tx, rx) = oneshot::channel();

    tx_devices
        .send(message(tx))
        .await
        .map_err(|e| DbusServiceError::TX {
            reason: "Failed to send message to devices manager".to_string(),
            error: anyhow!("{e}"),
        })?;

    rx.await.map_err(|e| DbusServiceError::RX {
        reason: "Error while waiting for devices manager answer".to_string(),
        error: e.into(),
    })
}

// Turn a `Done` answer into a D-Bus method result
fn done(answer: DevicesAnswer) -> fdo::Result<()> {
    match answer {
        DevicesAnswer::Done(Ok(())) => Ok(()),
        DevicesAnswer::Done(Err(err)) => Err(fdo::Error::Failed(err.to_string())),
        answer => Err(invalid_response(answer).into()),
    }
}

// Turn a `FanMode` answer into the Mode property value
fn mode_name(answer: DevicesAnswer) -> fdo::Result<String> {
    match answer {
        DevicesAnswer::FanMode(Some(mode)) => Ok(mode.to_string()),
        DevicesAnswer::FanMode(None) => {
            Err(fdo::Error::Failed("Unit is no longer managed".to_string()))
        }
        answer => Err(invalid_response(answer).into()),
    }
}

fn invalid_response(answer: DevicesAnswer) -> DbusServiceError {
    DbusServiceError::InvalidResponse {
        reason: format!("Invalid response from devices manager: {answer:?}"),
    }
}

// GPU D-Bus interface, one object per unit
struct GpuInterface {
    info: UnitInfo,

    tx_devices: Sender<DevicesMessage>,
    config: ConfigManager,
}

impl GpuInterface {
    fn new(
        info: UnitInfo,
        tx_devices: Sender<DevicesMessage>,
        config: ConfigManager,
    ) -> Self {
        Self {
            info,
            tx_devices,
            config,
        }
    }

    async fn status(&self) -> fdo::Result<SensorReading> {
        let unit = self.info.index;

        match request(&self.tx_devices, |tx| DevicesMessage::GetStatus { unit, tx })
            .await?
        {
            DevicesAnswer::Status(reading) => Ok(reading),
            answer => Err(invalid_response(answer).into()),
        }
    }
}

#[interface(name = "com.github.MossFan1.Gpu")]
impl GpuInterface {
    #[zbus(property)]
    async fn name(&self) -> String {
        self.info.name.clone()
    }

    #[zbus(property)]
    async fn vendor(&self) -> String {
        self.info.vendor.to_string()
    }

    #[zbus(property)]
    async fn temperature(&self) -> fdo::Result<f64> {
        Ok(self.status().await?.temperature as f64)
    }

    #[zbus(property)]
    async fn fan_duty(&self) -> fdo::Result<f64> {
        Ok(self.status().await?.fan_duty as f64)
    }

    #[zbus(property)]
    async fn fan_rpm(&self) -> fdo::Result<f64> {
        Ok(self.status().await?.fan_rpm as f64)
    }

    // "automatic", "curve \"<name>\"" or "manual <duty>%"
    #[zbus(property)]
    async fn mode(&self) -> fdo::Result<String> {
        let unit = self.info.index;

        mode_name(
            request(&self.tx_devices, |tx| DevicesMessage::GetFanMode { unit, tx }).await?,
        )
    }

    async fn set_manual(&self, duty: i32) -> fdo::Result<()> {
        let unit = self.info.index;

        done(
            request(&self.tx_devices, |tx| DevicesMessage::SetManual {
                unit,
                duty,
                tx,
            })
            .await?,
        )?;

        if let Err(err) = self.config.record_selection(unit, None) {
            warn!("Failed to save selection: {err}");
        }

        Ok(())
    }

    async fn start_auto(&self, curve: &str) -> fdo::Result<()> {
        let unit = self.info.index;

        let curve = self
            .config
            .resolve_curve(curve)
            .map_err(|e| fdo::Error::Failed(e.to_string()))?
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("Unknown curve \"{curve}\"")))?;

        let name = curve.name().to_string();

        done(
            request(&self.tx_devices, |tx| DevicesMessage::StartAuto {
                unit,
                curve,
                tx,
            })
            .await?,
        )?;

        if let Err(err) = self.config.record_selection(unit, Some(&name)) {
            warn!("Failed to save selection: {err}");
        }

        Ok(())
    }

    async fn stop_auto(&self) -> fdo::Result<()> {
        let unit = self.info.index;

        done(request(&self.tx_devices, |tx| DevicesMessage::StopAuto { unit, tx }).await?)
    }

    #[zbus(signal)]
    async fn fan_adjusted(
        emitter: &SignalEmitter<'_>,
        temperature: f64,
        duty: u8,
        curve: &str,
    ) -> zbus::Result<()>;
}

// Service wide D-Bus interface
struct ManagerInterface {
    tx_devices: Sender<DevicesMessage>,
    config: ConfigManager,
}

#[interface(name = "com.github.MossFan1.Manager")]
impl ManagerInterface {
    async fn reset_all_to_auto(&self) -> fdo::Result<()> {
        done(request(&self.tx_devices, |tx| DevicesMessage::ResetAllToAuto { tx }).await?)
    }

    // Built-in presets first, then the stored ones
    async fn list_curves(&self) -> fdo::Result<Vec<String>> {
        let mut curves: Vec<String> =
            presets::all().iter().map(|c| c.name().to_string()).collect();

        let stored = self
            .config
            .list_presets()
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;

        curves.extend(
            stored
                .into_iter()
                .filter(|name| presets::by_name(name).is_none()),
        );

        Ok(curves)
    }
}

pub struct DBusService {
    config: ConfigManager,
}

impl DBusService {
    pub fn new(config: ConfigManager) -> Self {
        Self { config }
    }

    pub async fn run(
        &mut self,
        run_token: CancellationToken,
        tx_devices: Sender<DevicesMessage>,
        mut rx_event: broadcast::Receiver<AdjustmentEvent>,
        tx_err: Sender<anyhow::Error>,
    ) {
        let connection = match self.connect(tx_devices).await {
            Ok(connection) => connection,
            Err(err) => {
                if let Err(cerr) = tx_err.send(err.into()).await {
                    error!("Failed to send error over channel: {}", cerr);
                }

                // Just return, there is nothing else to do
                return;
            }
        };

        info!("DBus service: Running as {}", SERVICE_NAME);

        loop {
            select! {
                _ = run_token.cancelled() => {
                    info!("DBus service: Quiting");
                    break;
                }
                event = rx_event.recv() => match event {
                    Ok(event) => {
                        if let Err(err) = emit_adjusted(&connection, &event).await {
                            debug!("Failed to emit FanAdjusted signal: {}", err);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("DBus service lagged, {} signals dropped", n);
                    }
                    Err(RecvError::Closed) => {
                        run_token.cancelled().await;
                    }
                }
            }
        }
    }

    // Connect to the session bus and publish one object per unit
    async fn connect(&self, tx_devices: Sender<DevicesMessage>) -> Result<Connection> {
        let connection = Connection::session().await.map_err(|e| {
            DbusServiceError::DBusConnection {
                reason: "Failed to establish connection with the bus".to_string(),
                error: e.into(),
            }
        })?;

        trace!("DBus connection established");

        let units = match request(&tx_devices, |tx| DevicesMessage::ListUnits { tx })
            .await?
        {
            DevicesAnswer::Units(units) => units,
            answer => return Err(invalid_response(answer)),
        };

        for info in units {
            trace!("Creating D-Bus object for unit: {}", info);

            let path = unit_path(info.index);
            let interface = GpuInterface::new(info, tx_devices.clone(), self.config.clone());

            connection
                .object_server()
                .at(path, interface)
                .await
                .map_err(|e| DbusServiceError::DBusObject {
                    reason: "Error while initializing GPU object".to_string(),
                    error: e.into(),
                })?;
        }

        connection
            .object_server()
            .at(
                ROOT_PATH,
                ManagerInterface {
                    tx_devices,
                    config: self.config.clone(),
                },
            )
            .await
            .map_err(|e| DbusServiceError::DBusObject {
                reason: "Error while initializing manager object".to_string(),
                error: e.into(),
            })?;

        // NOTE:    The name request must happen AFTER setting up the
        //          server objects or messages might be lost
        connection.request_name(SERVICE_NAME).await.map_err(|e| {
            DbusServiceError::DBusConnection {
                reason: "Failed to acquire service name".to_string(),
                error: e.into(),
            }
        })?;

        Ok(connection)
    }
}

async fn emit_adjusted(connection: &Connection, event: &AdjustmentEvent) -> zbus::Result<()> {
    let interface = connection
        .object_server()
        .interface::<_, GpuInterface>(unit_path(event.unit))
        .await?;

    GpuInterface::fan_adjusted(
        interface.signal_emitter(),
        event.temperature as f64,
        event.duty,
        &event.curve_name,
    )
    .await
}
