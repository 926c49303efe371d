/// Flooding attack (DoS)
///
/// One sender writing as fast as the bus accepts frames. There is no sleep;
/// the loop only yields to the scheduler every `frames_per_yield` frames so
/// the rest of the process keeps running.
use crate::attack_sim::{AttackKind, AttackReport};
use crate::can_bus::BusSender;
use crate::config::FloodConfig;
use crate::errors::{BusError, SetupError};
use crate::stop::StopSignal;
use crate::types::CanId;

pub struct Flooder {
    can_id: CanId,
    payload: Vec<u8>,
    frames_per_yield: usize,
}

impl Flooder {
    pub fn new(can_id: CanId, payload: Vec<u8>, frames_per_yield: usize) -> Result<Self, SetupError> {
        if !can_id.is_valid() {
            return Err(SetupError::InvalidParameter(format!(
                "flood id {} out of range",
                can_id
            )));
        }
        if payload.len() > 8 {
            return Err(SetupError::InvalidParameter(format!(
                "flood payload is {} bytes, at most 8 allowed",
                payload.len()
            )));
        }
        Ok(Self {
            can_id,
            payload,
            frames_per_yield: frames_per_yield.max(1),
        })
    }

    pub fn from_config(config: &FloodConfig) -> Result<Self, SetupError> {
        Self::new(
            CanId::from_raw(config.can_id),
            config.payload.clone(),
            config.frames_per_yield,
        )
    }

    pub fn can_id(&self) -> CanId {
        self.can_id
    }

    pub async fn run(&self, sender: BusSender, stop: StopSignal) -> AttackReport {
        let mut report = AttackReport::new(AttackKind::Flooding);
        let mut since_yield = 0usize;

        while !stop.is_stopped() {
            match sender.send(self.can_id, self.payload.clone()) {
                Ok(()) => report.frames_sent += 1,
                Err(BusError::Closed) => break,
                Err(e) => {
                    report.send_failures += 1;
                    tracing::debug!(error = %e, "flood frame rejected");
                }
            }

            since_yield += 1;
            if since_yield >= self.frames_per_yield {
                since_yield = 0;
                tokio::task::yield_now().await;
            }
        }
        report.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::can_ids;

    #[test]
    fn test_rejects_oversized_payload() {
        assert!(Flooder::new(can_ids::FLOOD, vec![0; 9], 64).is_err());
        assert!(Flooder::new(CanId::Standard(0x900), vec![0; 8], 64).is_err());

        let flooder = Flooder::from_config(&FloodConfig::default()).unwrap();
        assert_eq!(flooder.can_id(), can_ids::FLOOD);
        assert_eq!(flooder.frames_per_yield, 64);
    }
}
