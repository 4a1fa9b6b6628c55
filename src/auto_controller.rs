use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::broadcast::Sender,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, trace_span, warn};

use crate::{
    errors::MossFanError,
    fan_curve::{
        Curve, HysteresisGate, HysteresisThresholds,
        hysteresis::{DEFAULT_DUTY_THRESHOLD, DEFAULT_TEMPERATURE_THRESHOLD},
    },
    sensor::SensorSource,
};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 2000;

// Tuning of the automatic control loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub tick_interval_ms: u64,

    // Hysteresis thresholds
    pub duty_threshold: u8,
    pub temperature_threshold: f32,
}

impl ControllerSettings {
    pub fn interval(&self) -> Duration {
        // A zero period would make the timer spin
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn thresholds(&self) -> HysteresisThresholds {
        HysteresisThresholds {
            duty: self.duty_threshold,
            temperature: self.temperature_threshold,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            duty_threshold: DEFAULT_DUTY_THRESHOLD,
            temperature_threshold: DEFAULT_TEMPERATURE_THRESHOLD,
        }
    }
}

// Published after every fan command applied by an auto controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjustmentEvent {
    pub unit: usize,
    pub temperature: f32,
    pub duty: u8,
    pub curve_name: String,
    pub timestamp: DateTime<Local>,
}

// What a single tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    // The controller was stopped, nothing was done
    Stopped,
    Unavailable,
    // The sensor returned the 0 sentinel
    NoReading,
    // The hysteresis gate held the previous command
    Suppressed { temperature: f32, target: u8 },
    Applied(AdjustmentEvent),
}

#[derive(Debug)]
pub struct ControllerState {
    unit: usize,
    curve: Curve,

    gate: HysteresisGate,
}

impl ControllerState {
    pub fn new(unit: usize, curve: Curve, thresholds: HysteresisThresholds) -> Self {
        Self {
            unit,
            curve,
            gate: HysteresisGate::new(thresholds),
        }
    }

    pub fn last_temperature(&self) -> Option<f32> {
        self.gate.last_temperature()
    }

    pub fn last_commanded_duty(&self) -> Option<u8> {
        self.gate.last_duty()
    }

    // Run one evaluation of the control loop.
    // Errors leave the state untouched, the caller is expected
    // to log them and try again on the next tick
    pub fn tick(
        &mut self,
        source: &dyn SensorSource,
        token: &CancellationToken,
        tx_event: &Sender<AdjustmentEvent>,
    ) -> Result<TickOutcome, MossFanError> {
        if token.is_cancelled() {
            return Ok(TickOutcome::Stopped);
        }

        if !source.is_available() {
            return Ok(TickOutcome::Unavailable);
        }

        let temperature = source.read_temperature()?;

        // Exactly 0 means the sensor has no valid reading yet
        if temperature == 0. {
            return Ok(TickOutcome::NoReading);
        }

        let target = self.curve.evaluate(temperature);

        trace!(
            "Unit {} - temp: {}°C - target: {}% - curve: \"{}\"",
            self.unit,
            temperature,
            target,
            self.curve.name()
        );

        if !self.gate.should_update(temperature, target) {
            return Ok(TickOutcome::Suppressed {
                temperature,
                target,
            });
        }

        // A stop issued while reading must not reach the hardware
        if token.is_cancelled() {
            return Ok(TickOutcome::Stopped);
        }

        source.set_duty(target)?;

        if token.is_cancelled() {
            return Ok(TickOutcome::Stopped);
        }

        self.gate.record(temperature, target);

        let event = AdjustmentEvent {
            unit: self.unit,
            temperature,
            duty: target,
            curve_name: self.curve.name().to_string(),
            timestamp: Local::now(),
        };

        // Nobody listening is fine
        let _ = tx_event.send(event.clone());

        Ok(TickOutcome::Applied(event))
    }
}

struct ControllerTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

// Ticks run inline in the task, so they never overlap
pub struct AutoController {
    unit: usize,
    curve: Curve,

    source: Arc<dyn SensorSource>,
    tx_event: Sender<AdjustmentEvent>,

    settings: ControllerSettings,

    task: Option<ControllerTask>,
}

impl AutoController {
    pub fn new(
        unit: usize,
        curve: Curve,
        source: Arc<dyn SensorSource>,
        tx_event: Sender<AdjustmentEvent>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            unit,
            curve,
            source,
            tx_event,
            settings,
            task: None,
        }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    pub fn curve(&self) -> &Curve {
        &self.curve
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    // Start the control loop, does nothing if it is already running.
    // Must be called from within a tokio runtime
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let token = CancellationToken::new();
        let mut state = ControllerState::new(
            self.unit,
            self.curve.clone(),
            self.settings.thresholds(),
        );

        let source = self.source.clone();
        let tx_event = self.tx_event.clone();
        let period = self.settings.interval();
        let run_token = token.clone();

        info!(
            "Auto controller: Running on unit {} with curve \"{}\"",
            self.unit,
            self.curve.name()
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                select! {
                    biased;

                    _ = run_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = trace_span!("tick", unit = state.unit)
                            .in_scope(|| state.tick(source.as_ref(), &run_token, &tx_event));

                        match result {
                            Ok(TickOutcome::Applied(event)) => {
                                debug!(
                                    "Unit {}: {}°C -> {}%",
                                    event.unit, event.temperature, event.duty
                                );
                            }
                            Ok(outcome) => trace!("Tick outcome: {:?}", outcome),
                            // Failures are expected now and then,
                            // the next tick simply tries again
                            Err(err) => debug!("Tick failed on unit {}: {}", state.unit, err),
                        }
                    }
                }
            }
        });

        self.task = Some(ControllerTask { token, handle });
    }

    // Stop the control loop and wait for the running tick to finish.
    // Calling it on a stopped controller does nothing
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        task.token.cancel();

        if let Err(err) = task.handle.await {
            warn!("Auto controller task of unit {} ended abnormally: {}", self.unit, err);
        }

        info!("Auto controller: Stopped on unit {}", self.unit);
    }
}

impl Drop for AutoController {
    fn drop(&mut self) {
        // Without an await point the best we can do is to make
        // sure no further tick runs
        if let Some(task) = &self.task {
            task.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::sync::broadcast;

    use mockall::predicate::eq;

    use super::*;
    use crate::{sensor::MockSensorSource, test_utils::FakeSource};

    fn ramp() -> Curve {
        Curve::from_pairs("Ramp", &[(70., 60), (80., 80)])
    }

    fn state() -> ControllerState {
        ControllerState::new(0, ramp(), HysteresisThresholds::default())
    }

    fn channel() -> (Sender<AdjustmentEvent>, broadcast::Receiver<AdjustmentEvent>) {
        broadcast::channel(64)
    }

    #[test]
    fn small_drift_is_commanded_once() {
        let source = FakeSource::new("gpu", &[70., 70.5, 71.]);
        let token = CancellationToken::new();
        let (tx, _rx) = channel();
        let mut state = state();

        let outcomes: Vec<TickOutcome> = (0..3)
            .map(|_| state.tick(&source, &token, &tx).unwrap())
            .collect();

        assert_eq!(source.commands(), vec![60]);
        assert!(matches!(outcomes[0], TickOutcome::Applied(_)));
        assert_eq!(
            outcomes[1],
            TickOutcome::Suppressed {
                temperature: 70.5,
                target: 61
            }
        );
        assert_eq!(
            outcomes[2],
            TickOutcome::Suppressed {
                temperature: 71.,
                target: 62
            }
        );
    }

    #[test]
    fn two_degree_shift_passes_the_gate() {
        let source = FakeSource::new("gpu", &[70., 71., 72.]);
        let token = CancellationToken::new();
        let (tx, _rx) = channel();
        let mut state = state();

        for _ in 0..3 {
            state.tick(&source, &token, &tx).unwrap();
        }

        assert_eq!(source.commands(), vec![60, 64]);
        assert_eq!(state.last_temperature(), Some(72.));
        assert_eq!(state.last_commanded_duty(), Some(64));
    }

    #[test]
    fn applied_command_is_published() {
        let source = FakeSource::new("gpu", &[75.]);
        let token = CancellationToken::new();
        let (tx, mut rx) = channel();
        let mut state = ControllerState::new(3, ramp(), HysteresisThresholds::default());

        state.tick(&source, &token, &tx).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.unit, 3);
        assert_eq!(event.temperature, 75.);
        assert_eq!(event.duty, 70);
        assert_eq!(event.curve_name, "Ramp");
    }

    #[test]
    fn zero_reading_is_skipped() {
        let source = FakeSource::new("gpu", &[0., 70.]);
        let token = CancellationToken::new();
        let (tx, mut rx) = channel();
        let mut state = state();

        assert_eq!(
            state.tick(&source, &token, &tx).unwrap(),
            TickOutcome::NoReading
        );
        assert!(source.commands().is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(state.last_temperature(), None);

        state.tick(&source, &token, &tx).unwrap();
        assert_eq!(source.commands(), vec![60]);
    }

    #[test]
    fn unavailable_unit_is_not_polled() {
        let source = FakeSource::new("gpu", &[70.]);
        source.available.store(false, Ordering::SeqCst);
        let token = CancellationToken::new();
        let (tx, _rx) = channel();
        let mut state = state();

        assert_eq!(
            state.tick(&source, &token, &tx).unwrap(),
            TickOutcome::Unavailable
        );
        assert_eq!(source.reads(), 0);
    }

    #[test]
    fn failed_command_keeps_previous_state() {
        let source = FakeSource::new("gpu", &[70., 70.5]);
        source.fail_writes.store(true, Ordering::SeqCst);
        let token = CancellationToken::new();
        let (tx, mut rx) = channel();
        let mut state = state();

        assert!(state.tick(&source, &token, &tx).is_err());
        assert_eq!(state.last_commanded_duty(), None);
        assert!(rx.try_recv().is_err());

        // Nothing was recorded so the next tick commands again
        source.fail_writes.store(false, Ordering::SeqCst);
        state.tick(&source, &token, &tx).unwrap();

        assert_eq!(source.commands(), vec![61]);
    }

    #[test]
    fn read_failure_is_an_error() {
        let source = FakeSource::new("gpu", &[70.]);
        source.fail_reads.store(true, Ordering::SeqCst);
        let token = CancellationToken::new();
        let (tx, _rx) = channel();
        let mut state = state();

        assert!(matches!(
            state.tick(&source, &token, &tx),
            Err(MossFanError::Sensor(_))
        ));
        assert!(source.commands().is_empty());
    }

    #[test]
    fn cancelled_tick_has_no_effect() {
        let source = FakeSource::new("gpu", &[70.]);
        let token = CancellationToken::new();
        token.cancel();
        let (tx, mut rx) = channel();
        let mut state = state();

        assert_eq!(
            state.tick(&source, &token, &tx).unwrap(),
            TickOutcome::Stopped
        );
        assert!(source.commands().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_during_read_skips_the_command() {
        let token = CancellationToken::new();
        let (tx, mut rx) = channel();
        let mut state = state();

        let mut source = MockSensorSource::new();
        source.expect_is_available().return_const(true);
        {
            let token = token.clone();
            source.expect_read_temperature().times(1).returning(move || {
                token.cancel();
                Ok(75.)
            });
        }
        source.expect_set_duty().never();

        assert_eq!(
            state.tick(&source, &token, &tx).unwrap(),
            TickOutcome::Stopped
        );
        assert_eq!(state.last_commanded_duty(), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_during_command_publishes_nothing() {
        let token = CancellationToken::new();
        let (tx, mut rx) = channel();
        let mut state = state();

        let mut source = MockSensorSource::new();
        source.expect_is_available().return_const(true);
        source.expect_read_temperature().returning(|| Ok(75.));
        {
            let token = token.clone();
            source
                .expect_set_duty()
                .with(eq(70))
                .times(1)
                .returning(move |_| {
                    token.cancel();
                    Ok(())
                });
        }

        assert_eq!(
            state.tick(&source, &token, &tx).unwrap(),
            TickOutcome::Stopped
        );
        assert_eq!(state.last_temperature(), None);
        assert!(rx.try_recv().is_err());
    }

    fn controller(source: Arc<FakeSource>) -> (AutoController, broadcast::Receiver<AdjustmentEvent>) {
        let (tx, rx) = channel();
        let controller = AutoController::new(
            0,
            ramp(),
            source,
            tx,
            ControllerSettings::default(),
        );

        (controller, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_a_fixed_interval() {
        let source = Arc::new(FakeSource::new("gpu", &[70.]));
        let (mut controller, _rx) = controller(source.clone());

        controller.start();
        assert!(controller.is_running());

        // Ticks at 0, 2 and 4 seconds
        tokio::time::sleep(Duration::from_millis(4100)).await;
        assert_eq!(source.reads(), 3);

        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let source = Arc::new(FakeSource::new("gpu", &[70.]));
        let (mut controller, mut rx) = controller(source.clone());

        controller.start();
        controller.start();

        tokio::time::sleep(Duration::from_millis(4100)).await;

        // A second timer would have doubled the reads
        assert_eq!(source.reads(), 3);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop() {
        let source = Arc::new(FakeSource::new("gpu", &[70.]));
        let (mut controller, _rx) = controller(source.clone());

        controller.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        controller.stop().await;
        assert!(!controller.is_running());

        let reads = source.reads();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.reads(), reads);

        // Stopping twice is harmless
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_failures() {
        let source = Arc::new(FakeSource::new("gpu", &[70.]));
        source.fail_reads.store(true, Ordering::SeqCst);
        let (mut controller, mut rx) = controller(source.clone());

        controller.start();
        tokio::time::sleep(Duration::from_millis(4100)).await;

        assert!(controller.is_running());
        assert!(source.commands().is_empty());

        source.fail_reads.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2000)).await;

        assert_eq!(source.commands(), vec![60]);
        assert_eq!(rx.recv().await.unwrap().duty, 60);

        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop() {
        let source = Arc::new(FakeSource::new("gpu", &[70.]));
        let (mut controller, _rx) = controller(source.clone());

        controller.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.stop().await;

        controller.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.is_running());

        // A fresh state commands again on its first tick
        assert_eq!(source.commands(), vec![60, 60]);

        controller.stop().await;
    }

    #[test]
    fn settings_defaults() {
        let settings = ControllerSettings::default();

        assert_eq!(settings.interval(), Duration::from_secs(2));
        assert_eq!(settings.thresholds(), HysteresisThresholds::default());

        let zero = ControllerSettings {
            tick_interval_ms: 0,
            ..settings
        };
        assert_eq!(zero.interval(), Duration::from_millis(1));
    }
}
