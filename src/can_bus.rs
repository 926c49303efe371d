use crate::errors::{BusError, SetupError};
use crate::types::{CanFrame, CanId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

/// Frame plus the handle that published it, so bridges can skip their own echo
#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    frame: CanFrame,
}

struct BusInner {
    name: String,
    tx: RwLock<Option<broadcast::Sender<Envelope>>>,
    epoch: Instant,
    next_sender_id: AtomicU64,
}

/// Virtual CAN Bus
/// Uses broadcast channels to simulate a real CAN bus where all nodes see all messages
#[derive(Clone)]
pub struct VirtualCanBus {
    inner: Arc<BusInner>,
}

impl VirtualCanBus {
    /// Create a new virtual CAN bus with a specified buffer size
    pub fn new(buffer_size: usize) -> Self {
        Self::named("vcan0", buffer_size)
    }

    /// Create a bus with an interface label (shown in logs and raw traffic dumps)
    pub fn named(name: impl Into<String>, buffer_size: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer_size.max(1));
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                tx: RwLock::new(Some(tx)),
                epoch: Instant::now(),
                next_sender_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Monotonic bus time in seconds since the bus was created
    pub fn now(&self) -> f64 {
        self.inner.epoch.elapsed().as_secs_f64()
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .tx
            .read()
            .map(|tx| tx.is_some())
            .unwrap_or(false)
    }

    /// Close the bus. Pending frames still drain to receivers, which then
    /// observe `Received::Closed`; new attachments fail.
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.inner.tx.write() {
            tx.take();
        }
    }

    /// Attach a sending node to the bus
    pub fn attach_sender(&self, name: impl Into<String>) -> Result<BusSender, SetupError> {
        if !self.is_open() {
            return Err(SetupError::BusUnavailable(self.inner.name.clone()));
        }
        let id = self.inner.next_sender_id.fetch_add(1, Ordering::Relaxed);
        Ok(BusSender {
            bus: self.clone(),
            id,
            name: name.into(),
        })
    }

    /// Subscribe to receive every frame published from now on
    pub fn subscribe(&self) -> Result<BusSubscription, SetupError> {
        self.subscribe_filtered(None)
    }

    /// Subscribe, skipping frames published through `sender`
    pub fn subscribe_excluding(&self, sender: &BusSender) -> Result<BusSubscription, SetupError> {
        self.subscribe_filtered(Some(sender.id))
    }

    fn subscribe_filtered(&self, exclude: Option<u64>) -> Result<BusSubscription, SetupError> {
        let guard = self
            .inner
            .tx
            .read()
            .map_err(|_| SetupError::BusUnavailable(self.inner.name.clone()))?;
        let tx = guard
            .as_ref()
            .ok_or_else(|| SetupError::BusUnavailable(self.inner.name.clone()))?;
        Ok(BusSubscription {
            rx: tx.subscribe(),
            exclude,
            lagged: 0,
        })
    }

    /// Get the number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.inner
            .tx
            .read()
            .ok()
            .and_then(|tx| tx.as_ref().map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    fn publish(&self, origin: u64, frame: CanFrame) -> Result<(), BusError> {
        if !frame.id.is_valid() {
            return Err(BusError::InvalidId { id: frame.id });
        }
        if !frame.is_valid() {
            return Err(BusError::InvalidFrame {
                len: frame.data.len(),
            });
        }
        let guard = self.inner.tx.read().map_err(|_| BusError::Closed)?;
        let tx = guard.as_ref().ok_or(BusError::Closed)?;
        // A frame nobody listens to is simply gone, like on a real bus
        let _ = tx.send(Envelope { origin, frame });
        Ok(())
    }
}

/// Handle used by one sending node
pub struct BusSender {
    bus: VirtualCanBus,
    id: u64,
    name: String,
}

impl BusSender {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &VirtualCanBus {
        &self.bus
    }

    /// Current bus time
    pub fn now(&self) -> f64 {
        self.bus.now()
    }

    /// Publish a fully-formed frame (timestamp and source as given)
    pub fn publish(&self, frame: CanFrame) -> Result<(), BusError> {
        self.bus.publish(self.id, frame)
    }

    /// Build a frame stamped "now" under this sender's name and publish it
    pub fn send(&self, id: CanId, data: Vec<u8>) -> Result<(), BusError> {
        let frame = CanFrame::new(id, data, self.name.clone(), self.bus.now());
        self.publish(frame)
    }
}

/// Outcome of a bounded receive
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Frame(CanFrame),
    Timeout,
    Closed,
}

/// A registered receiver; dropping it unsubscribes
pub struct BusSubscription {
    rx: broadcast::Receiver<Envelope>,
    exclude: Option<u64>,
    lagged: u64,
}

impl BusSubscription {
    /// Wait up to `timeout` for the next frame
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Received {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Ok(envelope)) => {
                    if Some(envelope.origin) == self.exclude {
                        continue;
                    }
                    return Received::Frame(envelope.frame);
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    self.lagged += skipped;
                    tracing::warn!(skipped, "bus receiver lagged, frames dropped");
                }
                Ok(Err(RecvError::Closed)) => return Received::Closed,
                Err(_) => return Received::Timeout,
            }
        }
    }

    /// Frames dropped because this receiver fell behind the bus buffer
    pub fn lagged_frames(&self) -> u64 {
        self.lagged
    }

    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::can_ids;

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_can_bus_broadcast() {
        let bus = VirtualCanBus::new(100);
        let mut rx1 = bus.subscribe().unwrap();
        let mut rx2 = bus.subscribe().unwrap();
        let sender = bus.attach_sender("TEST_ECU").unwrap();

        sender
            .send(can_ids::ENGINE_RPM, vec![0x01, 0x02, 0x03])
            .unwrap();

        let Received::Frame(f1) = rx1.recv_timeout(WAIT).await else {
            panic!("rx1 got no frame");
        };
        let Received::Frame(f2) = rx2.recv_timeout(WAIT).await else {
            panic!("rx2 got no frame");
        };
        assert_eq!(f1.id, can_ids::ENGINE_RPM);
        assert_eq!(f2.data, vec![0x01, 0x02, 0x03]);
        assert_eq!(f1.source, "TEST_ECU");
    }

    #[tokio::test]
    async fn test_receive_times_out_without_traffic() {
        let bus = VirtualCanBus::new(10);
        let mut rx = bus.subscribe().unwrap();
        let started = Instant::now();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(30)).await,
            Received::Timeout
        );
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_per_sender_order_preserved() {
        let bus = VirtualCanBus::new(100);
        let mut rx = bus.subscribe().unwrap();
        let sender = bus.attach_sender("SEQ").unwrap();
        for i in 0..20u8 {
            sender.send(can_ids::BODY_HEARTBEAT, vec![i]).unwrap();
        }
        for i in 0..20u8 {
            match rx.recv_timeout(WAIT).await {
                Received::Frame(f) => assert_eq!(f.data, vec![i]),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_deregisters() {
        let bus = VirtualCanBus::new(10);
        let rx = bus.subscribe().unwrap();
        assert_eq!(bus.receiver_count(), 1);
        rx.unsubscribe();
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_frame_rejected() {
        let bus = VirtualCanBus::new(10);
        let sender = bus.attach_sender("BAD").unwrap();
        assert_eq!(
            sender.send(can_ids::ENGINE_RPM, vec![0; 9]),
            Err(BusError::InvalidFrame { len: 9 })
        );
        assert_eq!(
            sender.send(CanId::Standard(0x800), vec![0; 3]),
            Err(BusError::InvalidId {
                id: CanId::Standard(0x800)
            })
        );
    }

    #[tokio::test]
    async fn test_attach_after_shutdown_is_setup_error() {
        let bus = VirtualCanBus::new(10);
        let mut rx = bus.subscribe().unwrap();
        let sender = bus.attach_sender("ECU").unwrap();
        bus.shutdown();

        assert!(matches!(
            bus.attach_sender("LATE"),
            Err(SetupError::BusUnavailable(_))
        ));
        assert!(bus.subscribe().is_err());
        assert_eq!(
            sender.send(can_ids::ENGINE_RPM, vec![1]),
            Err(BusError::Closed)
        );
        assert_eq!(rx.recv_timeout(WAIT).await, Received::Closed);
    }

    #[tokio::test]
    async fn test_excluding_subscription_skips_own_frames() {
        let bus = VirtualCanBus::new(10);
        let bridge = bus.attach_sender("BRIDGE").unwrap();
        let local = bus.attach_sender("LOCAL").unwrap();
        let mut rx = bus.subscribe_excluding(&bridge).unwrap();

        bridge.send(can_ids::FLOOD, vec![0]).unwrap();
        local.send(can_ids::ENGINE_RPM, vec![1, 2]).unwrap();

        match rx.recv_timeout(WAIT).await {
            Received::Frame(f) => assert_eq!(f.source, "LOCAL"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lag_is_counted_not_fatal() {
        let bus = VirtualCanBus::new(4);
        let mut rx = bus.subscribe().unwrap();
        let sender = bus.attach_sender("FAST").unwrap();
        for i in 0..10u8 {
            sender.send(can_ids::FLOOD, vec![i]).unwrap();
        }
        match rx.recv_timeout(WAIT).await {
            Received::Frame(f) => assert_eq!(f.data, vec![6]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.lagged_frames(), 6);
    }
}
