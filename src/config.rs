use crate::anomaly_detection::AlertPolicy;
use crate::ecu::SignalKind;
use crate::errors::SetupError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete testbed configuration.
///
/// Every field has a default, so a config file only needs the values it
/// changes. Loaded once at startup; never mutated during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    pub bus: BusConfig,
    pub vehicle: VehicleConfig,
    pub ecus: Vec<EcuConfig>,
    pub observed: ObservedConfig,
    pub window: WindowConfig,
    pub detector: DetectorConfig,
    pub attacks: AttackConfig,
    pub log: LogConfig,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            vehicle: VehicleConfig::default(),
            ecus: EcuConfig::default_set(),
            observed: ObservedConfig::default(),
            window: WindowConfig::default(),
            detector: DetectorConfig::default(),
            attacks: AttackConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl TestbedConfig {
    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SetupError::Config(format!("{}: {}", path.display(), e)))?;
        let mut config: Self = serde_json::from_str(&text)
            .map_err(|e| SetupError::Config(format!("{}: {}", path.display(), e)))?;
        if config.ecus.is_empty() {
            config.ecus = EcuConfig::default_set();
        }
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given and present, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, SetupError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                tracing::info!(path = %p.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Period of the ECU that transmits the gear signal, if one is configured
    pub fn gear_period(&self) -> Option<Duration> {
        self.ecus
            .iter()
            .find(|e| e.kind == SignalKind::Gear)
            .map(|e| Duration::from_millis(e.period_ms))
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        if self.window.length_ms == 0 {
            return Err(SetupError::Config("window.length_ms must be > 0".into()));
        }
        if self.vehicle.tick_ms == 0 {
            return Err(SetupError::Config("vehicle.tick_ms must be > 0".into()));
        }
        if let Some(ecu) = self.ecus.iter().find(|e| e.period_ms == 0) {
            return Err(SetupError::Config(format!(
                "ecu {} has a zero send period",
                ecu.name
            )));
        }
        if self.detector.alert_streak == 0 {
            return Err(SetupError::Config("detector.alert_streak must be >= 1".into()));
        }
        if let Some(period) = self.gear_period() {
            self.attacks.context_spoof.validate(
                period,
                self.window.length(),
                self.detector.high_volume,
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broadcast buffer depth
    pub capacity: usize,
    pub server_addr: String,
    /// Interface label written into raw traffic logs
    pub interface: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            server_addr: "127.0.0.1:9000".to_string(),
            interface: "vcan0".to_string(),
        }
    }
}

/// Vehicle state machine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub tick_ms: u64,
    pub idle_rpm: i32,
    pub idle_jitter: i32,
    pub p_start_accelerating: f64,
    pub accel_step: i32,
    pub upshift_rpm: i32,
    pub upshift_drop: i32,
    pub cruise_rpm: i32,
    pub cruise_oscillation: f64,
    pub cruise_jitter: i32,
    pub cruise_step: i32,
    pub cruise_dwell_secs: f64,
    pub p_start_braking: f64,
    pub brake_step: i32,
    pub downshift_rpm: i32,
    pub downshift_bump: i32,
    pub redline_rpm: i32,
    pub redline_jitter: i32,
    pub anomaly_min_secs: f64,
    pub anomaly_timeout_secs: f64,
    pub seed: Option<u64>,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            idle_rpm: 800,
            idle_jitter: 50,
            p_start_accelerating: 0.02,
            accel_step: 120,
            upshift_rpm: 3500,
            upshift_drop: 1000,
            cruise_rpm: 2200,
            cruise_oscillation: 200.0,
            cruise_jitter: 50,
            cruise_step: 10,
            cruise_dwell_secs: 20.0,
            p_start_braking: 0.005,
            brake_step: 200,
            downshift_rpm: 1500,
            downshift_bump: 800,
            redline_rpm: 7000,
            redline_jitter: 500,
            anomaly_min_secs: 2.0,
            anomaly_timeout_secs: 4.0,
            seed: None,
        }
    }
}

impl VehicleConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// One periodic signal source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcuConfig {
    pub name: String,
    pub kind: SignalKind,
    pub period_ms: u64,
}

impl EcuConfig {
    pub fn new(name: &str, kind: SignalKind, period_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            period_ms,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Engine 20ms, transmission 100ms, ABS 50ms, body heartbeat 1s
    pub fn default_set() -> Vec<Self> {
        vec![
            Self::new("Engine", SignalKind::Rpm, 20),
            Self::new("Trans", SignalKind::Gear, 100),
            Self::new("ABS", SignalKind::Brake, 50),
            Self::new("Body", SignalKind::Heartbeat, 1000),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservedConfig {
    /// A signal not updated within this interval is reported unknown
    pub stale_after_ms: u64,
    pub rate_interval_ms: u64,
    /// Bus load (msg/s) above which the terminal view flags a flood
    pub flood_rate_warning: u64,
}

impl Default for ObservedConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 1000,
            rate_interval_ms: 1000,
            flood_rate_warning: 1000,
        }
    }
}

impl ObservedConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn rate_interval(&self) -> Duration {
        Duration::from_millis(self.rate_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub length_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { length_ms: 100 }
    }
}

impl WindowConfig {
    pub fn length(&self) -> Duration {
        Duration::from_millis(self.length_ms)
    }
}

/// Detector thresholds. The classification numbers are tuned to the
/// default traffic profile and 100ms window; they are not physical constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub artifact_dir: PathBuf,
    /// Consecutive anomalous windows needed before an alert fires
    pub alert_streak: u32,
    /// msgCount above this is flooding
    pub high_volume: usize,
    /// iatMean below this (seconds) is flooding
    pub min_iat_secs: f64,
    /// msgCount above this is spoofing / replay
    pub moderate_volume: usize,
    /// When unset, chosen from the display mode
    pub alert_policy: Option<AlertPolicy>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("models"),
            alert_streak: 3,
            high_volume: 100,
            min_iat_secs: 0.001,
            moderate_volume: 20,
            alert_policy: None,
        }
    }
}

impl DetectorConfig {
    pub fn effective_policy(&self, web_ui: bool) -> AlertPolicy {
        self.alert_policy.unwrap_or(if web_ui {
            AlertPolicy::SuppressWeakAnomaly
        } else {
            AlertPolicy::ShowAll
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    pub flood: FloodConfig,
    pub replay: ReplayConfig,
    pub context_spoof: ContextSpoofConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    pub can_id: u32,
    pub payload: Vec<u8>,
    /// Frames sent between scheduler yields; no sleep-based pacing
    pub frames_per_yield: usize,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            can_id: 0x000,
            payload: vec![0; 8],
            frames_per_yield: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub record_secs: f64,
    /// Capture buffer bound
    pub max_capture: usize,
    pub frame_gap_ms: u64,
    pub loop_gap_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            record_secs: 5.0,
            max_capture: 50_000,
            frame_gap_ms: 2,
            loop_gap_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSpoofConfig {
    pub rpm_threshold: u16,
    pub trigger_gear: u8,
    pub forged_gear: u8,
    pub inject_secs: f64,
    pub inject_period_ms: u64,
    pub backoff_secs: f64,
    pub poll_ms: u64,
}

impl Default for ContextSpoofConfig {
    fn default() -> Self {
        Self {
            rpm_threshold: 2000,
            trigger_gear: 5,
            forged_gear: 2,
            inject_secs: 4.0,
            inject_period_ms: 5,
            backoff_secs: 10.0,
            poll_ms: 100,
        }
    }
}

impl ContextSpoofConfig {
    pub fn inject_period(&self) -> Duration {
        Duration::from_millis(self.inject_period_ms)
    }

    /// Forged frames that land in one detection window
    pub fn forged_per_window(&self, window: Duration) -> usize {
        if self.inject_period_ms == 0 {
            return usize::MAX;
        }
        (window.as_millis() / self.inject_period_ms as u128) as usize
    }

    /// Reject rates that either lose the race against the genuine sender
    /// or reach the flooding volume on their own.
    pub fn validate(
        &self,
        genuine_period: Duration,
        window: Duration,
        high_volume: usize,
    ) -> Result<(), SetupError> {
        if self.inject_period_ms == 0 || self.inject_period() >= genuine_period {
            return Err(SetupError::InvalidParameter(format!(
                "context spoof period {}ms must be faster than the genuine gear period {}ms",
                self.inject_period_ms,
                genuine_period.as_millis()
            )));
        }
        let per_window = self.forged_per_window(window);
        if per_window >= high_volume {
            return Err(SetupError::InvalidParameter(format!(
                "context spoof sends {} frames per window, at or above the flooding volume {}",
                per_window, high_volume
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default tracing filter; `RUST_LOG` overrides it
    pub level: String,
    /// Directory for the hash-chained security log; disabled when unset
    pub security_log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            security_log_dir: None,
        }
    }
}

/// Install the tracing subscriber for a binary: stderr, filter from
/// `RUST_LOG` or `level`.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// True when running under the web dashboard (`WEB_UI` set)
pub fn web_ui_mode() -> bool {
    std::env::var_os("WEB_UI").is_some()
}
