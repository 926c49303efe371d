use crate::can_bus::{BusSender, VirtualCanBus};
use crate::config::EcuConfig;
use crate::errors::{BusError, SetupError};
use crate::stop::StopSignal;
use crate::types::{CanId, can_ids, encoding};
use crate::vehicle::VehicleSnapshot;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Physical signal carried by one ECU's frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Rpm,
    Gear,
    Brake,
    Heartbeat,
}

impl SignalKind {
    pub fn can_id(&self) -> CanId {
        match self {
            SignalKind::Rpm => can_ids::ENGINE_RPM,
            SignalKind::Gear => can_ids::TRANSMISSION,
            SignalKind::Brake => can_ids::ABS_STATUS,
            SignalKind::Heartbeat => can_ids::BODY_HEARTBEAT,
        }
    }

    /// Encode the current vehicle state into this signal's payload
    pub fn encode(&self, snapshot: &VehicleSnapshot) -> Vec<u8> {
        match self {
            SignalKind::Rpm => encoding::encode_rpm(snapshot.rpm).to_vec(),
            SignalKind::Gear => encoding::encode_gear(snapshot.gear).to_vec(),
            SignalKind::Brake => encoding::encode_brake(snapshot.is_braking()).to_vec(),
            SignalKind::Heartbeat => encoding::BODY_HEARTBEAT_PAYLOAD.to_vec(),
        }
    }
}

/// Periodic sender for one signal
#[derive(Debug, Clone)]
pub struct SignalSource {
    pub name: String,
    pub kind: SignalKind,
    pub period: Duration,
}

impl SignalSource {
    pub fn new(name: impl Into<String>, kind: SignalKind, period: Duration) -> Self {
        Self {
            name: name.into(),
            kind,
            period,
        }
    }

    pub fn from_config(config: &EcuConfig) -> Self {
        Self::new(config.name.clone(), config.kind, config.period())
    }

    /// Send loop: read snapshot, encode, publish, sleep out the rest of the period.
    ///
    /// A failed send is logged and the next period tries again; the loop
    /// only ends on stop or when the bus is closed.
    pub async fn run(
        self,
        sender: BusSender,
        snapshots: watch::Receiver<VehicleSnapshot>,
        stop: StopSignal,
    ) {
        let mut sent = 0u64;
        while !stop.is_stopped() {
            let started = Instant::now();
            let snapshot = *snapshots.borrow();
            let payload = self.kind.encode(&snapshot);

            match sender.send(self.kind.can_id(), payload) {
                Ok(()) => sent += 1,
                Err(BusError::Closed) => {
                    tracing::info!(ecu = %self.name, "bus closed, stopping");
                    break;
                }
                Err(e) => tracing::warn!(ecu = %self.name, error = %e, "send failed"),
            }

            tokio::time::sleep(self.period.saturating_sub(started.elapsed())).await;
        }
        tracing::debug!(ecu = %self.name, sent, "signal source stopped");
    }
}

/// Start one task per configured ECU
pub fn spawn_ecus(
    bus: &VirtualCanBus,
    configs: &[EcuConfig],
    snapshots: &watch::Receiver<VehicleSnapshot>,
    stop: &StopSignal,
) -> Result<Vec<JoinHandle<()>>, SetupError> {
    let mut handles = Vec::with_capacity(configs.len());
    for config in configs {
        let source = SignalSource::from_config(config);
        let sender = bus.attach_sender(source.name.clone())?;
        tracing::info!(
            ecu = %source.name,
            id = %source.kind.can_id(),
            period_ms = config.period_ms,
            "ECU online"
        );
        handles.push(tokio::spawn(source.run(
            sender,
            snapshots.clone(),
            stop.clone(),
        )));
    }
    Ok(handles)
}
