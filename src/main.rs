use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use moss_fan::{
    arg_parser::{ArgsOptions, Command},
    config_manager::ConfigManager,
    dbus_service::DBusService,
    devices_manager::{DevicesAnswer, DevicesManager, DevicesMessage},
    fan_curve::{Curve, presets},
    logger,
    notifier::{ConsoleSink, NotificationSink, TracingSink, forward_events},
};
use tokio::{
    select,
    signal::ctrl_c,
    sync::{mpsc, oneshot},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

// Manual duties below this get a warning
const LOW_DUTY_WARNING: i32 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse the command line arguments
    let args_options = ArgsOptions::parse();

    logger::init_logging(args_options.verbose);

    let config_manager = open_store(&args_options)?;
    let config = config_manager.load_config();

    let unit = args_options.unit.unwrap_or(config.last_selected_unit);
    let console: Arc<dyn NotificationSink> = Arc::new(ConsoleSink::stdout());

    // These don't need any hardware
    match args_options.command() {
        Command::Curves => return print_curves(&config_manager),
        Command::ExportPresets => {
            for path in config_manager.export_builtin_presets()? {
                println!("{}", path.display());
            }

            return Ok(());
        }
        _ => {}
    }

    let mut devices_manager = DevicesManager::new(config.controller);

    match args_options.command() {
        Command::List => {
            let units = devices_manager.discover();

            if units.is_empty() {
                println!("No supported GPU found");
            }

            for info in units {
                println!("{info}");
            }
        }
        Command::Status => print_status(&devices_manager),
        Command::Diagnose => print_diagnostics(&devices_manager),
        Command::Reset => {
            // Stops every controller and releases every unit
            devices_manager.dispose().await;

            console.alert(None, "Every fan is back under automatic control");
        }
        Command::Run { duty, curve, dbus } => {
            run(devices_manager, config_manager, unit, duty, curve, dbus, console)
                .await?;
        }
        Command::Default => match config.profile_to_restore() {
            Some(profile) => {
                info!("Restoring profile \"{}\" on unit {}", profile, unit);

                let profile = Some(profile.to_string());
                run(devices_manager, config_manager, unit, None, profile, false, console)
                    .await?;
            }
            None => print_status(&devices_manager),
        },
        Command::Curves | Command::ExportPresets => {}
    }

    Ok(())
}

fn open_store(args_options: &ArgsOptions) -> Result<ConfigManager> {
    let config_path = match &args_options.config_file_path {
        Some(path) => path.clone(),
        None => ConfigManager::default_config_path()
            .with_context(|| "Failed to locate the configuration file")?,
    };

    let presets_dir = match &args_options.presets_dir {
        Some(path) => path.clone(),
        None => ConfigManager::default_presets_dir()
            .with_context(|| "Failed to locate the presets directory")?,
    };

    Ok(ConfigManager::new(&config_path, &presets_dir))
}

fn print_status(devices_manager: &DevicesManager) {
    let readings = devices_manager.status_all();

    if readings.is_empty() {
        println!("No supported GPU found");
    }

    for reading in readings {
        println!("{reading}");
    }
}

fn print_diagnostics(devices_manager: &DevicesManager) {
    for info in devices_manager.discover() {
        println!("{info}");
        println!("  id:          {}", info.id);
        println!(
            "  fan control: {}",
            devices_manager.fan_control_status(info.index)
        );

        match devices_manager.read_status(info.index) {
            Ok(reading) => println!("  sensors:     {reading}"),
            Err(err) => println!("  sensors:     {err}"),
        }
    }
}

fn print_curves(config_manager: &ConfigManager) -> Result<()> {
    let print_curve = |curve: &Curve| {
        let points: Vec<String> =
            curve.points().iter().map(|p| p.to_string()).collect();

        println!("{}: {}", curve.name(), points.join(", "));
    };

    presets::all().iter().for_each(print_curve);

    for name in config_manager.list_presets()? {
        if presets::by_name(&name).is_some() {
            continue;
        }

        if let Some(curve) = config_manager.load_preset(&name)? {
            print_curve(&curve);
        }
    }

    Ok(())
}

// Control the fans until Ctrl-C, then give them back to the driver
async fn run(
    mut devices_manager: DevicesManager,
    config_manager: ConfigManager,
    unit: usize,
    duty: Option<i32>,
    curve: Option<String>,
    dbus: bool,
    console: Arc<dyn NotificationSink>,
) -> Result<()> {
    let curve = match curve {
        Some(name) => Some(
            config_manager
                .resolve_curve(&name)?
                .with_context(|| format!("Unknown fan curve \"{name}\""))?,
        ),
        None => None,
    };

    if let Some(duty) = duty.filter(|d| *d < LOW_DUTY_WARNING) {
        console.alert(
            Some(unit),
            &format!("Fan duty {duty}% is low, watch the temperature"),
        );
    }

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Use thin channel to move errors back to the main task
    let (tx_err, mut rx_err) = mpsc::channel(16);

    // Start the event forwarder
    {
        let token = token.clone();
        let rx_event = devices_manager.subscribe();

        let mut sinks = vec![console];
        if dbus {
            sinks.push(Arc::new(TracingSink));
        }

        tracker.spawn(forward_events(token, rx_event, sinks));
    }

    let rx_dbus_event = devices_manager.subscribe();

    // Start the devices manager
    let (tx_devices_manager, rx_devices_manager) = mpsc::channel(16);
    {
        let token = token.clone();
        let tx_err = tx_err.clone();

        tracker.spawn(async move {
            devices_manager.run(token, rx_devices_manager, tx_err).await;
        });
    }

    // Start the D-Bus service
    if dbus {
        let token = token.clone();
        let tx_err = tx_err.clone();
        let tx_devices_manager = tx_devices_manager.clone();
        let config_manager = config_manager.clone();

        tracker.spawn(async move {
            let mut dbus_service = DBusService::new(config_manager);
            dbus_service
                .run(token, tx_devices_manager, rx_dbus_event, tx_err)
                .await;
        });
    }

    let result = apply(&tx_devices_manager, &config_manager, unit, duty, curve).await;

    if result.is_ok() {
        // TODO: Handle SIGTERM as well for graceful termination under systemd
        loop {
            select! {
                _ = ctrl_c() => { break; },
                err_msg = rx_err.recv() => {
                    if let Some(err) = err_msg {
                        for e in err.chain() {
                            error!("{e}");
                        }
                    }
                }
            }
        }
    }

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();

    // Wait for the tasks to finish
    tracker.close();
    tracker.wait().await;

    result
}

// Send the requested duty or curve to the devices manager
async fn apply(
    tx_devices_manager: &mpsc::Sender<DevicesMessage>,
    config_manager: &ConfigManager,
    unit: usize,
    duty: Option<i32>,
    curve: Option<Curve>,
) -> Result<()> {
    let (tx, rx) = oneshot::channel();

    let (message, profile) = match (duty, curve) {
        (Some(_), Some(_)) => bail!("--duty and --curve can't be used together"),
        (Some(duty), None) => (DevicesMessage::SetManual { unit, duty, tx }, None),
        (None, Some(curve)) => {
            let name = curve.name().to_string();

            (DevicesMessage::StartAuto { unit, curve, tx }, Some(name))
        }
        (None, None) => return Ok(()),
    };

    tx_devices_manager
        .send(message)
        .await
        .map_err(|_| anyhow!("Devices manager send error"))?;

    match rx.await.with_context(|| "Devices manager dropped the request")? {
        DevicesAnswer::Done(result) => {
            result.with_context(|| format!("Failed to control unit {unit}"))?
        }
        answer => bail!("Unexpected answer from devices manager: {answer:?}"),
    }

    if let Err(err) = config_manager.record_selection(unit, profile.as_deref()) {
        warn!("Failed to save the selection: {err}");
    }

    Ok(())
}
