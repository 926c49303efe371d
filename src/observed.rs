use crate::can_bus::{Received, VirtualCanBus};
use crate::config::ObservedConfig;
use crate::errors::SetupError;
use crate::stop::StopSignal;
use crate::types::{CanFrame, can_ids, encoding};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;

const RECV_TIMEOUT: Duration = Duration::from_millis(10);

/// One decoded signal value and the bus time it was last seen
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalReading<T> {
    pub value: T,
    pub updated_at: f64,
}

impl<T: Copy> SignalReading<T> {
    /// The value, unless it is older than `stale_after`
    pub fn fresh(&self, now: f64, stale_after: Duration) -> Option<T> {
        if now - self.updated_at > stale_after.as_secs_f64() {
            None
        } else {
            Some(self.value)
        }
    }
}

/// Vehicle signals as seen on the bus (which may be forged).
///
/// Written only by the feedback listener; everyone else reads a copy from
/// the watch channel, so a reader always sees one consistent update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObservedSignals {
    pub rpm: Option<SignalReading<u16>>,
    pub gear: Option<SignalReading<u8>>,
    pub brake: Option<SignalReading<bool>>,
    /// Every frame seen, whatever its id
    pub total_frames: u64,
    /// Frames seen during the last complete rate interval
    pub rate: u64,
}

impl ObservedSignals {
    /// Decode a frame into the matching signal. Returns true if a signal changed.
    pub fn apply(&mut self, frame: &CanFrame, now: f64) -> bool {
        self.total_frames += 1;
        if frame.id == can_ids::ENGINE_RPM {
            if let Some(rpm) = encoding::decode_rpm(&frame.data) {
                self.rpm = Some(SignalReading {
                    value: rpm,
                    updated_at: now,
                });
                return true;
            }
        } else if frame.id == can_ids::TRANSMISSION {
            if let Some(gear) = encoding::decode_gear(&frame.data) {
                self.gear = Some(SignalReading {
                    value: gear,
                    updated_at: now,
                });
                return true;
            }
        } else if frame.id == can_ids::ABS_STATUS
            && let Some(braking) = encoding::decode_brake(&frame.data)
        {
            self.brake = Some(SignalReading {
                value: braking,
                updated_at: now,
            });
            return true;
        }
        false
    }

    /// Last gear value seen, however old
    pub fn latest_gear(&self) -> Option<u8> {
        self.gear.map(|g| g.value)
    }

    /// Gear for display: `None` when never seen or stale
    pub fn gear_at(&self, now: f64, stale_after: Duration) -> Option<u8> {
        self.gear.and_then(|g| g.fresh(now, stale_after))
    }

    pub fn rpm_at(&self, now: f64, stale_after: Duration) -> Option<u16> {
        self.rpm.and_then(|r| r.fresh(now, stale_after))
    }

    pub fn brake_at(&self, now: f64, stale_after: Duration) -> Option<bool> {
        self.brake.and_then(|b| b.fresh(now, stale_after))
    }
}

/// Frames-per-interval counter over a monotonically growing total
#[derive(Debug, Clone)]
pub struct RateMeter {
    interval: f64,
    started_at: f64,
    total_at_start: u64,
}

impl RateMeter {
    pub fn new(interval: Duration, now: f64) -> Self {
        Self {
            interval: interval.as_secs_f64(),
            started_at: now,
            total_at_start: 0,
        }
    }

    /// Returns the count of the interval that just completed, if one did
    pub fn update(&mut self, total: u64, now: f64) -> Option<u64> {
        if now - self.started_at < self.interval {
            return None;
        }
        let rate = total.saturating_sub(self.total_at_start);
        self.started_at = now;
        self.total_at_start = total;
        Some(rate)
    }
}

/// Bus listener that keeps `ObservedSignals` current.
///
/// Subscribes on entry and drops the subscription on every exit path.
pub async fn run_feedback_listener(
    bus: VirtualCanBus,
    tx: watch::Sender<ObservedSignals>,
    config: ObservedConfig,
    stop: StopSignal,
) -> Result<(), SetupError> {
    let mut subscription = bus.subscribe()?;
    let mut signals = ObservedSignals::default();
    let mut meter = RateMeter::new(config.rate_interval(), bus.now());

    while !stop.is_stopped() {
        let mut changed = false;
        match subscription.recv_timeout(RECV_TIMEOUT).await {
            Received::Frame(frame) => {
                signals.apply(&frame, bus.now());
                changed = true;
            }
            Received::Timeout => {}
            Received::Closed => {
                tracing::info!("bus closed, feedback listener exiting");
                break;
            }
        }
        if let Some(rate) = meter.update(signals.total_frames, bus.now()) {
            signals.rate = rate;
            changed = true;
        }
        if changed {
            tx.send_replace(signals.clone());
        }
    }
    if subscription.lagged_frames() > 0 {
        tracing::warn!(
            lagged = subscription.lagged_frames(),
            "feedback listener fell behind the bus"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: crate::types::CanId, data: &[u8]) -> CanFrame {
        CanFrame::new(id, data.to_vec(), "T".into(), 0.0)
    }

    #[test]
    fn test_apply_decodes_each_signal() {
        let mut signals = ObservedSignals::default();
        assert!(signals.apply(&frame(can_ids::ENGINE_RPM, &[0x22, 0x60]), 1.0));
        assert!(signals.apply(&frame(can_ids::TRANSMISSION, &[5, 0, 0, 0]), 1.0));
        assert!(signals.apply(&frame(can_ids::ABS_STATUS, &[1, 0]), 1.0));
        assert!(!signals.apply(&frame(can_ids::FLOOD, &[0; 8]), 1.0));

        assert_eq!(signals.rpm.map(|r| r.value), Some(2200));
        assert_eq!(signals.latest_gear(), Some(5));
        assert_eq!(signals.brake.map(|b| b.value), Some(true));
        assert_eq!(signals.total_frames, 4);
    }

    #[test]
    fn test_gear_goes_unknown_when_stale() {
        let mut signals = ObservedSignals::default();
        let stale = Duration::from_secs(1);
        assert_eq!(signals.gear_at(0.0, stale), None);

        signals.apply(&frame(can_ids::TRANSMISSION, &[3, 0, 0, 0]), 10.0);
        assert_eq!(signals.gear_at(10.5, stale), Some(3));
        assert_eq!(signals.gear_at(11.2, stale), None);
        // still the last known value for the feedback loop
        assert_eq!(signals.latest_gear(), Some(3));
    }

    #[test]
    fn test_rate_meter_reports_full_intervals() {
        let mut meter = RateMeter::new(Duration::from_secs(1), 0.0);
        assert_eq!(meter.update(40, 0.5), None);
        assert_eq!(meter.update(90, 1.0), Some(90));
        assert_eq!(meter.update(120, 1.5), None);
        assert_eq!(meter.update(150, 2.1), Some(60));
    }

    #[tokio::test]
    async fn test_listener_publishes_bus_values() {
        let bus = VirtualCanBus::new(100);
        let (tx, mut rx) = watch::channel(ObservedSignals::default());
        let stop = StopSignal::new();
        let listener = tokio::spawn(run_feedback_listener(
            bus.clone(),
            tx,
            ObservedConfig::default(),
            stop.clone(),
        ));

        // wait for the subscription to exist before sending
        while bus.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        let sender = bus.attach_sender("Trans").unwrap();
        sender
            .send(can_ids::TRANSMISSION, encoding::encode_gear(4).to_vec())
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.latest_gear() == Some(4)))
            .await
            .expect("gear never observed")
            .unwrap();

        stop.stop();
        listener.await.unwrap().unwrap();
        assert_eq!(bus.receiver_count(), 0, "subscription released on exit");
    }
}
