use crate::anomaly_detection::{DetectionResult, DetectorStats, EnsembleDetector};
use crate::can_bus::VirtualCanBus;
use crate::errors::SetupError;
use crate::features::{FeatureVector, run_window_loop};
use crate::security_log::SecurityLogger;
use crate::status::{AlertLine, render_alert_terminal, render_quiet_window};
use crate::stop::StopSignal;
use crossterm::{cursor, execute, terminal};
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::mpsc;

/// How detection results reach the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutput {
    /// One line per visible alert, nothing else (dashboard mode)
    Plain,
    /// One line per window, rewritten in place
    Terminal,
    Silent,
}

impl AlertOutput {
    pub fn for_mode(web_ui: bool) -> Self {
        if web_ui {
            AlertOutput::Plain
        } else {
            AlertOutput::Terminal
        }
    }

    fn emit(&self, result: &DetectionResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        match self {
            AlertOutput::Plain => {
                if result.alert && result.visible {
                    writeln!(stdout, "{}", AlertLine::from_result(result).render())?;
                    stdout.flush()?;
                }
                Ok(())
            }
            AlertOutput::Terminal => {
                let line = if result.alert && result.visible {
                    render_alert_terminal(&AlertLine::from_result(result))
                } else {
                    render_quiet_window(result)
                };
                execute!(
                    stdout,
                    cursor::MoveToColumn(0),
                    terminal::Clear(terminal::ClearType::CurrentLine)
                )?;
                write!(stdout, "{}", line)?;
                stdout.flush()
            }
            AlertOutput::Silent => Ok(()),
        }
    }
}

/// Live detection run: one detector, fed one feature vector per window.
///
/// Every alert, visible or suppressed, goes to the security log and to the
/// optional results channel; only the output mode decides what is printed.
pub struct LiveIds {
    detector: EnsembleDetector,
    output: AlertOutput,
    security_log: Option<SecurityLogger>,
    results: Option<mpsc::UnboundedSender<DetectionResult>>,
}

impl LiveIds {
    pub fn new(detector: EnsembleDetector) -> Self {
        Self {
            detector,
            output: AlertOutput::Silent,
            security_log: None,
            results: None,
        }
    }

    pub fn with_output(mut self, output: AlertOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_security_log(mut self, log: Option<SecurityLogger>) -> Self {
        self.security_log = log;
        self
    }

    /// Also forward every result to `tx`
    pub fn with_results(mut self, tx: mpsc::UnboundedSender<DetectionResult>) -> Self {
        self.results = Some(tx);
        self
    }

    pub fn detector(&self) -> &EnsembleDetector {
        &self.detector
    }

    /// Score one closed window
    pub fn handle_window(&mut self, features: &FeatureVector) -> DetectionResult {
        let result = self.detector.evaluate(features);
        tracing::debug!(
            msg_count = result.msg_count,
            fused = result.fused,
            streak = result.streak,
            error = result.reconstruction_error,
            "window scored"
        );

        if result.alert {
            if result.visible {
                tracing::warn!(label = %result.label, msg_count = result.msg_count, streak = result.streak, "alert");
            } else {
                tracing::debug!(label = %result.label, "alert suppressed by policy");
            }
            if let Some(log) = &self.security_log {
                log.log_alert(
                    result.label.as_str(),
                    result.msg_count,
                    result.streak,
                    result.tags(),
                    result.visible,
                );
            }
        }

        if let Err(e) = self.output.emit(&result) {
            tracing::warn!(error = %e, "alert output write failed");
        }
        let receiver_gone = self
            .results
            .as_ref()
            .is_some_and(|tx| tx.send(result.clone()).is_err());
        if receiver_gone {
            self.results = None;
        }
        result
    }

    /// Aggregate `bus` traffic into windows and score them until stopped
    pub async fn run(
        mut self,
        bus: &VirtualCanBus,
        window: Duration,
        stop: StopSignal,
    ) -> Result<DetectorStats, SetupError> {
        let subscription = bus.subscribe()?;
        if let Some(log) = &self.security_log {
            log.log_detector_reset("detection run started");
        }
        self.detector.reset();
        tracing::info!(
            window_ms = window.as_millis() as u64,
            alert_streak = self.detector.alert_streak(),
            policy = ?self.detector.policy(),
            "monitoring"
        );

        let lagged = run_window_loop(subscription, bus.clone(), window, stop, |features| {
            self.handle_window(&features);
        })
        .await;

        if self.output == AlertOutput::Terminal {
            println!();
        }
        let stats = self.detector.stats();
        tracing::info!(
            windows = stats.windows,
            anomalous = stats.anomalous_windows,
            alerts = stats.alerts,
            suppressed = stats.suppressed_alerts,
            lagged,
            "detection stopped"
        );
        if let Some(log) = &self.security_log {
            log.log_statistics(stats.windows, stats.anomalous_windows, stats.alerts, lagged);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly_detection::{
        AlertPolicy, AttackLabel, BoundaryModel, ReconstructionModel, Standardizer,
    };
    use crate::config::DetectorConfig;
    use ndarray::{Array1, ArrayView1};

    /// Outside whenever the standardized message count is above zero
    struct VolumeBoundary;

    impl BoundaryModel for VolumeBoundary {
        fn decision(&self, z: ArrayView1<f64>) -> f64 {
            -z[0]
        }
    }

    struct Identity;

    impl ReconstructionModel for Identity {
        fn reconstruct(&self, z: ArrayView1<f64>) -> Array1<f64> {
            z.to_owned()
        }
    }

    fn detector(policy: AlertPolicy) -> EnsembleDetector {
        let standardizer = Standardizer::new(vec![10.0, 0.0, 0.0, 0.0, 0.0, 0.0], vec![1.0; 6]).unwrap();
        EnsembleDetector::new(
            standardizer,
            Box::new(VolumeBoundary),
            Box::new(Identity),
            1.0,
            &DetectorConfig::default(),
            policy,
        )
    }

    fn window(msg_count: usize) -> FeatureVector {
        FeatureVector {
            msg_count,
            unique_ids: 1,
            iat_mean: 0.004,
            ..FeatureVector::default()
        }
    }

    #[test]
    fn test_results_forwarded_including_suppressed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ids = LiveIds::new(detector(AlertPolicy::SuppressWeakAnomaly)).with_results(tx);

        for _ in 0..3 {
            ids.handle_window(&window(15));
        }
        let mut results = Vec::new();
        while let Ok(r) = rx.try_recv() {
            results.push(r);
        }
        assert_eq!(results.len(), 3);
        let last = results.last().unwrap();
        assert!(last.alert);
        assert_eq!(last.label, AttackLabel::Anomaly);
        assert!(!last.visible);
        assert_eq!(ids.detector().stats().suppressed_alerts, 1);
    }

    #[tokio::test]
    async fn test_run_scores_bus_windows() {
        let bus = VirtualCanBus::new(1000);
        let stop = StopSignal::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ids = LiveIds::new(detector(AlertPolicy::ShowAll)).with_results(tx);

        let run_bus = bus.clone();
        let run_stop = stop.clone();
        let task = tokio::spawn(async move {
            ids.run(&run_bus, Duration::from_millis(50), run_stop).await
        });

        while bus.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        let sender = bus.attach_sender("Engine").unwrap();
        sender.send(crate::types::can_ids::ENGINE_RPM, vec![0x22, 0x60]).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.msg_count, 1);
        assert!(!result.fused);

        stop.stop();
        let stats = task.await.unwrap().unwrap();
        assert!(stats.windows >= 1);
    }
}
