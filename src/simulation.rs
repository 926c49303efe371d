use crate::can_bus::VirtualCanBus;
use crate::config::{ObservedConfig, TestbedConfig};
use crate::ecu::spawn_ecus;
use crate::errors::SetupError;
use crate::observed::{ObservedSignals, run_feedback_listener};
use crate::security_log::SecurityLogger;
use crate::status::StatusLine;
use crate::stop::StopSignal;
use crate::vehicle::{VehicleModel, VehicleSnapshot};
use crossterm::{cursor, execute, terminal};
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Where the per-tick status line goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutput {
    /// One `STATE:` line per tick for the dashboard
    Plain,
    /// Single line rewritten in place
    Terminal { flood_warning: u64 },
    Silent,
}

impl StatusOutput {
    pub fn for_mode(web_ui: bool, observed: &ObservedConfig) -> Self {
        if web_ui {
            StatusOutput::Plain
        } else {
            StatusOutput::Terminal {
                flood_warning: observed.flood_rate_warning,
            }
        }
    }

    pub fn emit(&self, line: &StatusLine) -> io::Result<()> {
        let mut stdout = io::stdout();
        match self {
            StatusOutput::Plain => {
                writeln!(stdout, "{}", line.render())?;
                stdout.flush()
            }
            StatusOutput::Terminal { flood_warning } => {
                execute!(
                    stdout,
                    cursor::MoveToColumn(0),
                    terminal::Clear(terminal::ClearType::CurrentLine)
                )?;
                write!(stdout, "{}", line.render_terminal(*flood_warning))?;
                stdout.flush()
            }
            StatusOutput::Silent => Ok(()),
        }
    }

    /// Leave the in-place line behind before other output
    pub fn finish(&self) -> io::Result<()> {
        if let StatusOutput::Terminal { .. } = self {
            println!();
        }
        Ok(())
    }
}

/// Fixed-rate vehicle control loop.
///
/// Each tick feeds the latest bus-observed gear into the model, publishes
/// the new snapshot to the ECUs and reports the status line.
pub struct ControlLoop {
    model: VehicleModel,
    snapshots: watch::Sender<VehicleSnapshot>,
    observed: watch::Receiver<ObservedSignals>,
    clock: VirtualCanBus,
    observed_config: ObservedConfig,
    tick: Duration,
    output: StatusOutput,
    security_log: Option<SecurityLogger>,
}

impl ControlLoop {
    pub fn new(
        model: VehicleModel,
        snapshots: watch::Sender<VehicleSnapshot>,
        observed: watch::Receiver<ObservedSignals>,
        clock: VirtualCanBus,
        config: &TestbedConfig,
    ) -> Self {
        Self {
            model,
            snapshots,
            observed,
            clock,
            observed_config: config.observed.clone(),
            tick: config.vehicle.tick(),
            output: StatusOutput::Silent,
            security_log: None,
        }
    }

    pub fn with_output(mut self, output: StatusOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_security_log(mut self, log: Option<SecurityLogger>) -> Self {
        self.security_log = log;
        self
    }

    /// One control step of `dt` seconds
    pub fn step(&mut self, dt: f64) -> (VehicleSnapshot, StatusLine) {
        let observed = self.observed.borrow().clone();
        let before = self.model.mode();
        let snapshot = self.model.tick(dt, observed.latest_gear());

        if snapshot.mode != before {
            tracing::info!(from = %before, to = %snapshot.mode, rpm = snapshot.rpm, "vehicle mode change");
            if let Some(log) = &self.security_log {
                log.log_mode_change(before.as_str(), snapshot.mode.as_str());
            }
        }
        self.snapshots.send_replace(snapshot);

        let now = self.clock.now();
        let status = StatusLine {
            mode: snapshot.mode,
            rpm: observed.rpm.map(|r| r.value).unwrap_or(0),
            gear: observed.gear_at(now, self.observed_config.stale_after()),
            rate: observed.rate,
        };
        (snapshot, status)
    }

    /// Tick until stopped; returns the final snapshot
    pub async fn run(mut self, stop: StopSignal) -> VehicleSnapshot {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();
        let mut snapshot = self.model.snapshot();

        while !stop.is_stopped() {
            interval.tick().await;
            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f64();
            last = now;

            let (next, status) = self.step(dt);
            snapshot = next;
            if let Err(e) = self.output.emit(&status) {
                tracing::warn!(error = %e, "status line write failed");
            }
        }
        let _ = self.output.finish();
        snapshot
    }
}

/// Task handles of a running simulation
pub struct SimulationHandles {
    pub observed: watch::Receiver<ObservedSignals>,
    pub snapshots: watch::Receiver<VehicleSnapshot>,
    control: JoinHandle<VehicleSnapshot>,
    listener: JoinHandle<Result<(), SetupError>>,
    ecus: Vec<JoinHandle<()>>,
}

impl SimulationHandles {
    /// Wait for every task to exit (after the stop signal trips)
    pub async fn join(self) -> Result<VehicleSnapshot, SetupError> {
        for ecu in self.ecus {
            if let Err(e) = ecu.await {
                tracing::warn!(error = %e, "ECU task failed");
            }
        }
        match self.listener.await {
            Ok(result) => result?,
            Err(e) => tracing::warn!(error = %e, "feedback listener task failed"),
        }
        self.control.await.map_err(|e| {
            tracing::error!(error = %e, "control loop task failed");
            SetupError::TaskFailed {
                task: "control loop",
                reason: e.to_string(),
            }
        })
    }
}

/// One simulation run: vehicle model, ECUs and the feedback listener, all
/// wired to one bus. Nothing is global; two runs on two buses do not
/// interact.
pub struct Simulation {
    bus: VirtualCanBus,
    config: TestbedConfig,
    stop: StopSignal,
    output: StatusOutput,
    security_log: Option<SecurityLogger>,
}

impl Simulation {
    pub fn new(bus: VirtualCanBus, config: TestbedConfig, stop: StopSignal) -> Self {
        Self {
            bus,
            config,
            stop,
            output: StatusOutput::Silent,
            security_log: None,
        }
    }

    pub fn with_output(mut self, output: StatusOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_security_log(mut self, log: Option<SecurityLogger>) -> Self {
        self.security_log = log;
        self
    }

    /// Attach everything to the bus and start the tasks. Fails before any
    /// task starts if the bus is unavailable.
    pub fn start(self, model: VehicleModel) -> Result<SimulationHandles, SetupError> {
        if !self.bus.is_open() {
            return Err(SetupError::BusUnavailable(self.bus.name().to_string()));
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(model.snapshot());
        let (observed_tx, observed_rx) = watch::channel(ObservedSignals::default());

        let ecus = spawn_ecus(&self.bus, &self.config.ecus, &snapshot_rx, &self.stop)?;
        let listener = tokio::spawn(run_feedback_listener(
            self.bus.clone(),
            observed_tx,
            self.config.observed.clone(),
            self.stop.clone(),
        ));

        if let Some(log) = &self.security_log {
            log.log_startup("vehicle_simulation");
        }
        let control = ControlLoop::new(
            model,
            snapshot_tx,
            observed_rx.clone(),
            self.bus.clone(),
            &self.config,
        )
        .with_output(self.output)
        .with_security_log(self.security_log);
        let control = tokio::spawn(control.run(self.stop.clone()));

        tracing::info!(
            ecus = self.config.ecus.len(),
            tick_ms = self.config.vehicle.tick_ms,
            "simulation running"
        );
        Ok(SimulationHandles {
            observed: observed_rx,
            snapshots: snapshot_rx,
            control,
            listener,
            ecus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VehicleConfig;
    use crate::observed::SignalReading;
    use crate::vehicle::VehicleMode;

    fn quiet_vehicle() -> VehicleConfig {
        VehicleConfig {
            p_start_accelerating: 0.0,
            seed: Some(7),
            ..VehicleConfig::default()
        }
    }

    #[test]
    fn test_step_reports_observed_values() {
        let bus = VirtualCanBus::new(16);
        let config = TestbedConfig::default();
        let (snap_tx, snap_rx) = watch::channel(VehicleSnapshot::default());
        let (obs_tx, obs_rx) = watch::channel(ObservedSignals::default());

        let now = bus.now();
        obs_tx.send_replace(ObservedSignals {
            rpm: Some(SignalReading { value: 2210, updated_at: now }),
            gear: Some(SignalReading { value: 5, updated_at: now }),
            brake: None,
            total_frames: 120,
            rate: 92,
        });

        let mut control = ControlLoop::new(
            VehicleModel::new(quiet_vehicle()),
            snap_tx,
            obs_rx,
            bus,
            &config,
        );
        let (snapshot, status) = control.step(0.1);
        assert_eq!(snapshot.mode, VehicleMode::Idle);
        assert_eq!(*snap_rx.borrow(), snapshot);
        assert_eq!(status.rpm, 2210);
        assert_eq!(status.gear, Some(5));
        assert_eq!(status.rate, 92);
    }

    #[test]
    fn test_step_without_bus_data_shows_unknown_gear() {
        let bus = VirtualCanBus::new(16);
        let (snap_tx, _snap_rx) = watch::channel(VehicleSnapshot::default());
        let (_obs_tx, obs_rx) = watch::channel(ObservedSignals::default());
        let mut control = ControlLoop::new(
            VehicleModel::new(quiet_vehicle()),
            snap_tx,
            obs_rx,
            bus,
            &TestbedConfig::default(),
        );
        let (_, status) = control.step(0.1);
        assert_eq!(status.gear, None);
        assert!(status.render().contains("GEAR:???"));
    }

    #[tokio::test]
    async fn test_start_on_closed_bus_fails() {
        let bus = VirtualCanBus::new(16);
        bus.shutdown();
        let sim = Simulation::new(bus, TestbedConfig::load_or_default(None).unwrap(), StopSignal::new());
        assert!(matches!(
            sim.start(VehicleModel::new(quiet_vehicle())),
            Err(SetupError::BusUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_simulation_runs_and_stops() {
        let bus = VirtualCanBus::new(1000);
        let stop = StopSignal::new();
        let handles = Simulation::new(bus.clone(), TestbedConfig::default(), stop.clone())
            .start(VehicleModel::new(quiet_vehicle()))
            .unwrap();

        let mut observed = handles.observed.clone();
        tokio::time::timeout(
            Duration::from_secs(2),
            observed.wait_for(|s| s.latest_gear() == Some(0) && s.rpm.is_some()),
        )
        .await
        .expect("ECU traffic never observed")
        .unwrap();

        stop.stop();
        let last = handles.join().await.unwrap();
        assert_eq!(last.mode, VehicleMode::Idle);
        assert_eq!(bus.receiver_count(), 0);
    }

    async fn explode<T>() -> T {
        panic!("task blew up")
    }

    #[tokio::test]
    async fn test_control_loop_panic_is_task_failure() {
        let (_obs_tx, observed) = watch::channel(ObservedSignals::default());
        let (_snap_tx, snapshots) = watch::channel(VehicleSnapshot::default());
        let handles = SimulationHandles {
            observed,
            snapshots,
            control: tokio::spawn(explode::<VehicleSnapshot>()),
            listener: tokio::spawn(async { Ok(()) }),
            ecus: vec![tokio::spawn(explode::<()>())],
        };

        match handles.join().await {
            Err(SetupError::TaskFailed { task, .. }) => assert_eq!(task, "control loop"),
            other => panic!("expected a task failure, got {:?}", other.map(|s| s.mode)),
        }
    }
}
