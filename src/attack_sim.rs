/// Attack Simulation Framework
///
/// Adversarial senders that share the bus with the genuine ECUs:
/// - Flooding: one sender at maximum rate, no pacing
/// - Replay: record the bus, then loop the capture with fresh timestamps
/// - Context spoof: wait for a physical precondition, then out-pace the
///   genuine gear sender while staying under the flooding volume
///
/// Each injector is a small state machine that does no I/O itself, plus an
/// async driver that connects it to a bus.
pub mod context_spoof;
pub mod flooding;
pub mod replay;

use crate::can_bus::VirtualCanBus;
use crate::config::AttackConfig;
use crate::errors::SetupError;
use crate::security_log::SecurityLogger;
use crate::stop::StopSignal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Attack type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    Flooding,
    Replay,
    ContextSpoof,
}

impl AttackKind {
    pub const ALL: [AttackKind; 3] = [
        AttackKind::Flooding,
        AttackKind::Replay,
        AttackKind::ContextSpoof,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttackKind::Flooding => "flooding",
            AttackKind::Replay => "replay",
            AttackKind::ContextSpoof => "context_spoof",
        }
    }

    /// Sender name used on the bus
    pub fn sender_name(&self) -> &'static str {
        match self {
            AttackKind::Flooding => "ATTACK_FLOOD",
            AttackKind::Replay => "ATTACK_REPLAY",
            AttackKind::ContextSpoof => "ATTACK_SPOOF",
        }
    }
}

impl fmt::Display for AttackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttackKind::Flooding => write!(f, "Flooding Attack"),
            AttackKind::Replay => write!(f, "Replay Attack"),
            AttackKind::ContextSpoof => write!(f, "Context-Aware Gear Spoof"),
        }
    }
}

impl FromStr for AttackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttackKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                format!("unknown attack '{}', expected flooding, replay or context_spoof", s)
            })
    }
}

/// Attack result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackReport {
    pub attack: AttackKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// Frames accepted by the bus
    pub frames_sent: u64,

    /// Sends the bus rejected
    pub send_failures: u64,

    /// Frames recorded (replay)
    pub frames_captured: u64,

    /// Completed replay loops or spoof injection bursts
    pub cycles: u64,
}

impl AttackReport {
    pub fn new(attack: AttackKind) -> Self {
        Self {
            attack,
            start_time: Utc::now(),
            end_time: Utc::now(),
            frames_sent: 0,
            send_failures: 0,
            frames_captured: 0,
            cycles: 0,
        }
    }

    pub fn finish(mut self) -> Self {
        self.end_time = Utc::now();
        self
    }

    /// Calculate attack duration in milliseconds
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }

    pub fn frames_per_sec(&self) -> f64 {
        let ms = self.duration_ms();
        if ms <= 0 {
            0.0
        } else {
            self.frames_sent as f64 * 1000.0 / ms as f64
        }
    }

    /// Share of attempted sends the bus accepted
    pub fn delivery_rate(&self) -> f64 {
        let attempted = self.frames_sent + self.send_failures;
        if attempted == 0 {
            0.0
        } else {
            self.frames_sent as f64 / attempted as f64
        }
    }
}

/// Run one injector on `bus` until `stop` trips or the bus closes
pub async fn run_attack(
    kind: AttackKind,
    bus: &VirtualCanBus,
    config: &AttackConfig,
    stop: StopSignal,
    security_log: Option<SecurityLogger>,
) -> Result<AttackReport, SetupError> {
    let sender = bus.attach_sender(kind.sender_name())?;
    tracing::info!(attack = %kind, sender = kind.sender_name(), "injector attached");
    if let Some(log) = &security_log {
        log.log_injector_phase(kind.as_str(), "STARTED");
    }

    let report = match kind {
        AttackKind::Flooding => {
            let flooder = flooding::Flooder::from_config(&config.flood)?;
            flooder.run(sender, stop).await
        }
        AttackKind::Replay => {
            replay::run_replay(sender, &config.replay, stop, security_log.clone()).await?
        }
        AttackKind::ContextSpoof => {
            let spoofer = context_spoof::ContextSpoofer::new(config.context_spoof.clone());
            context_spoof::run_context_spoof(spoofer, sender, stop, security_log.clone()).await?
        }
    };

    if let Some(log) = &security_log {
        log.log_injector_phase(kind.as_str(), "STOPPED");
    }
    tracing::info!(
        attack = %kind,
        frames = report.frames_sent,
        failures = report.send_failures,
        fps = format!("{:.0}", report.frames_per_sec()),
        "injector finished"
    );
    Ok(report)
}
