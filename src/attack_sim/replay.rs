/// Replay attack
///
/// Two phases: record every frame seen on the bus for a fixed time, then
/// loop the capture forever, restamping each frame at send time.
use crate::attack_sim::{AttackKind, AttackReport};
use crate::can_bus::{BusSender, Received};
use crate::config::ReplayConfig;
use crate::errors::{BusError, SetupError};
use crate::security_log::SecurityLogger;
use crate::stop::StopSignal;
use crate::types::CanFrame;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Bounded capture buffer. When full, the oldest frame is dropped.
#[derive(Debug)]
pub struct ReplayRecorder {
    captured: VecDeque<CanFrame>,
    max_capture: usize,
    dropped: u64,
}

impl ReplayRecorder {
    pub fn new(max_capture: usize) -> Self {
        let max_capture = max_capture.max(1);
        Self {
            captured: VecDeque::with_capacity(max_capture.min(4096)),
            max_capture,
            dropped: 0,
        }
    }

    /// Capture a frame for later replay
    pub fn capture(&mut self, frame: CanFrame) {
        if self.captured.len() >= self.max_capture {
            self.captured.pop_front();
            self.dropped += 1;
        }
        self.captured.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.captured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captured.is_empty()
    }

    /// Frames lost to the capture bound
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// End the record phase. `None` if nothing was captured.
    pub fn finish(self) -> Option<ReplayLoop> {
        if self.captured.is_empty() {
            None
        } else {
            Some(ReplayLoop {
                frames: self.captured.into(),
                cursor: 0,
                loops: 0,
            })
        }
    }
}

/// Endless cursor over a non-empty capture
#[derive(Debug)]
pub struct ReplayLoop {
    frames: Vec<CanFrame>,
    cursor: usize,
    loops: u64,
}

/// Next frame to send and whether it closes a pass over the capture
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayStep {
    pub frame: CanFrame,
    pub end_of_loop: bool,
}

impl ReplayLoop {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Completed passes
    pub fn loops(&self) -> u64 {
        self.loops
    }

    /// Next captured frame, restamped to `now`
    pub fn next_frame(&mut self, now: f64) -> ReplayStep {
        let frame = self.frames[self.cursor].restamped(now);
        self.cursor += 1;
        let end_of_loop = self.cursor == self.frames.len();
        if end_of_loop {
            self.cursor = 0;
            self.loops += 1;
        }
        ReplayStep { frame, end_of_loop }
    }
}

/// Record from the bus `sender` is attached to (its own frames excluded),
/// then replay until stopped.
pub async fn run_replay(
    sender: BusSender,
    config: &ReplayConfig,
    stop: StopSignal,
    security_log: Option<SecurityLogger>,
) -> Result<AttackReport, SetupError> {
    let mut report = AttackReport::new(AttackKind::Replay);
    let phase = |name: &str| {
        tracing::info!(phase = name, "replay phase");
        if let Some(log) = &security_log {
            log.log_injector_phase(AttackKind::Replay.as_str(), name);
        }
    };

    phase("RECORDING");
    let mut subscription = sender.bus().subscribe_excluding(&sender)?;
    let mut recorder = ReplayRecorder::new(config.max_capture);
    let record_until = Instant::now() + Duration::from_secs_f64(config.record_secs.max(0.0));

    while !stop.is_stopped() {
        let now = Instant::now();
        if now >= record_until {
            break;
        }
        match subscription.recv_timeout(record_until - now).await {
            Received::Frame(frame) => recorder.capture(frame),
            Received::Timeout => {}
            Received::Closed => break,
        }
    }
    subscription.unsubscribe();

    report.frames_captured = recorder.len() as u64;
    if recorder.dropped() > 0 {
        tracing::warn!(dropped = recorder.dropped(), "capture buffer full, oldest frames dropped");
    }
    let Some(mut replay) = recorder.finish() else {
        tracing::warn!("nothing captured, replay skipped");
        return Ok(report.finish());
    };
    tracing::info!(frames = replay.len(), "capture complete");

    phase("REPLAYING");
    let frame_gap = Duration::from_millis(config.frame_gap_ms);
    let loop_gap = Duration::from_millis(config.loop_gap_ms);

    'replay: while !stop.is_stopped() {
        let step = replay.next_frame(sender.now());
        match sender.publish(step.frame) {
            Ok(()) => report.frames_sent += 1,
            Err(BusError::Closed) => break 'replay,
            Err(e) => {
                report.send_failures += 1;
                tracing::warn!(error = %e, "replay send failed");
            }
        }
        tokio::time::sleep(frame_gap).await;
        if step.end_of_loop {
            tokio::time::sleep(loop_gap).await;
        }
    }

    report.cycles = replay.loops();
    Ok(report.finish())
}
