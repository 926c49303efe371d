use crate::can_bus::{BusSubscription, Received, VirtualCanBus};
use crate::errors::DataError;
use crate::stop::StopSignal;
use crate::types::CanFrame;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;

/// Statistics of one window of bus traffic, in model column order
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    pub msg_count: usize,
    pub unique_ids: usize,
    pub id_entropy: f64,
    pub payload_entropy: f64,
    pub iat_mean: f64,
    pub iat_std: f64,
}

impl FeatureVector {
    pub const COLUMNS: [&'static str; 6] = [
        "msg_count",
        "unique_ids",
        "id_entropy",
        "payload_entropy",
        "iat_mean",
        "iat_std",
    ];

    pub fn as_array(&self) -> [f64; 6] {
        [
            self.msg_count as f64,
            self.unique_ids as f64,
            self.id_entropy,
            self.payload_entropy,
            self.iat_mean,
            self.iat_std,
        ]
    }

    /// Compute features over `frames`; `None` for an empty slice
    pub fn from_frames(frames: &[CanFrame]) -> Option<Self> {
        if frames.is_empty() {
            return None;
        }

        let unique_ids = frames.iter().map(|f| f.id).collect::<HashSet<_>>().len();
        let id_entropy = shannon_entropy(frames.iter().map(|f| f.id));
        let payload_entropy = shannon_entropy(frames.iter().map(|f| f.data.as_slice()));

        let mut stamps: Vec<f64> = frames.iter().map(|f| f.timestamp).collect();
        stamps.sort_by(|a, b| a.total_cmp(b));
        let iats: Vec<f64> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        let (iat_mean, iat_std) = mean_and_std(&iats);

        Some(Self {
            msg_count: frames.len(),
            unique_ids,
            id_entropy,
            payload_entropy,
            iat_mean,
            iat_std,
        })
    }
}

/// Shannon entropy (bits) of the empirical distribution of `symbols`.
/// Zero for an empty sequence.
pub fn shannon_entropy<T, I>(symbols: I) -> f64
where
    T: Eq + Hash,
    I: IntoIterator<Item = T>,
{
    let mut counts: HashMap<T, usize> = HashMap::new();
    let mut total = 0usize;
    for symbol in symbols {
        *counts.entry(symbol).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            p * (total / c as f64).log2()
        })
        .sum()
}

/// Mean and population standard deviation; zeros for an empty slice
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Frames received during `[start, end)`, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub start: f64,
    pub end: f64,
    pub frames: Vec<CanFrame>,
}

impl Window {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            frames: Vec::new(),
        }
    }

    pub fn push(&mut self, frame: CanFrame) {
        self.frames.push(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn features(&self) -> Result<FeatureVector, DataError> {
        FeatureVector::from_frames(&self.frames).ok_or(DataError::EmptyWindow)
    }
}

/// Cuts a frame stream into back-to-back fixed-length windows.
///
/// Holds exactly one open window. Time is passed in by the caller, so the
/// same aggregator drives both the live loop and tests.
#[derive(Debug)]
pub struct WindowAggregator {
    length: f64,
    current: Window,
}

impl WindowAggregator {
    pub fn new(length: Duration, start: f64) -> Self {
        let length = length.as_secs_f64();
        Self {
            length,
            current: Window::new(start, start + length),
        }
    }

    /// End time of the open window
    pub fn deadline(&self) -> f64 {
        self.current.end
    }

    pub fn open_window(&self) -> &Window {
        &self.current
    }

    pub fn push(&mut self, frame: CanFrame) {
        self.current.push(frame);
    }

    /// Close the open window if `now` has reached its end.
    ///
    /// The next window starts exactly where the closed one ended. Windows
    /// that elapsed entirely while nobody called in were empty and are
    /// skipped. Returns the closed window's features unless it was empty.
    pub fn close_due(&mut self, now: f64) -> Option<FeatureVector> {
        if now < self.current.end {
            return None;
        }
        let mut start = self.current.end;
        if now >= start + self.length {
            let missed = ((now - start) / self.length).floor();
            start += missed * self.length;
        }
        let closed = std::mem::replace(&mut self.current, Window::new(start, start + self.length));
        match closed.features() {
            Ok(features) => Some(features),
            Err(DataError::EmptyWindow) => {
                tracing::trace!(start = closed.start, "empty window skipped");
                None
            }
            Err(_) => None,
        }
    }
}

/// Live aggregation loop: feeds `on_window` one feature vector per
/// non-empty window until stopped or the bus closes. Returns the number of
/// frames lost to receiver lag.
pub async fn run_window_loop<F>(
    mut subscription: BusSubscription,
    clock: VirtualCanBus,
    length: Duration,
    stop: StopSignal,
    mut on_window: F,
) -> u64
where
    F: FnMut(FeatureVector),
{
    let mut aggregator = WindowAggregator::new(length, clock.now());
    while !stop.is_stopped() {
        let remaining = (aggregator.deadline() - clock.now()).clamp(0.0, length.as_secs_f64());
        if remaining > 0.0 {
            match subscription
                .recv_timeout(Duration::from_secs_f64(remaining))
                .await
            {
                Received::Frame(frame) => aggregator.push(frame),
                Received::Timeout => {}
                Received::Closed => break,
            }
        }
        if let Some(features) = aggregator.close_due(clock.now()) {
            on_window(features);
        }
    }
    if subscription.lagged_frames() > 0 {
        tracing::warn!(
            lagged = subscription.lagged_frames(),
            "window aggregator fell behind the bus"
        );
    }
    subscription.lagged_frames()
}
