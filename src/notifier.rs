use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

use tokio::{
    select,
    sync::broadcast::{Receiver, error::RecvError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auto_controller::AdjustmentEvent;

// Receiver of status updates and alerts
pub trait NotificationSink: Send + Sync {
    // A fan command was applied by an auto controller
    fn adjusted(&self, event: &AdjustmentEvent);

    // Something the user should know about, `unit` is None for global alerts
    fn alert(&self, unit: Option<usize>, message: &str);
}

// Write notifications to the log
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn adjusted(&self, event: &AdjustmentEvent) {
        info!(
            "Unit {}: {:.1}°C, fan set to {}% (curve \"{}\")",
            event.unit, event.temperature, event.duty, event.curve_name
        );
    }

    fn alert(&self, unit: Option<usize>, message: &str) {
        match unit {
            Some(unit) => warn!("Unit {}: {}", unit, message),
            None => warn!("{}", message),
        }
    }
}

// [14:02:11] GPU 0 | Temp: 64.0°C | Fan: 47% | Balanced
pub struct ConsoleSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    fn write_line(&self, line: &str) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };

        if let Err(err) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            debug!("Console sink write failed: {}", err);
        }
    }
}

impl NotificationSink for ConsoleSink {
    fn adjusted(&self, event: &AdjustmentEvent) {
        self.write_line(&format!(
            "[{}] GPU {} | Temp: {:.1}°C | Fan: {}% | {}",
            event.timestamp.format("%H:%M:%S"),
            event.unit,
            event.temperature,
            event.duty,
            event.curve_name
        ));
    }

    fn alert(&self, unit: Option<usize>, message: &str) {
        match unit {
            Some(unit) => self.write_line(&format!("GPU {unit}: {message}")),
            None => self.write_line(message),
        }
    }
}

// Pump adjustment events into every sink until cancelled
// or until every sender is gone
pub async fn forward_events(
    run_token: CancellationToken,
    mut rx_event: Receiver<AdjustmentEvent>,
    sinks: Vec<Arc<dyn NotificationSink>>,
) {
    debug!("Event forwarder: Running");

    loop {
        select! {
            _ = run_token.cancelled() => break,
            event = rx_event.recv() => match event {
                Ok(event) => sinks.iter().for_each(|sink| sink.adjusted(&event)),
                Err(RecvError::Lagged(n)) => {
                    warn!("Event forwarder lagged, {} events dropped", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    debug!("Event forwarder: Quiting");
}
