/// Detection Event Log
///
/// Append-only audit trail of detection-relevant events (alerts, model
/// loads, vehicle reactions, injector phases) using chained hashing.
/// Each entry includes a hash of the previous entry, so a modified,
/// dropped or reordered line is detectable.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Types of events to log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum SecurityEvent {
    /// Component started
    SystemStartup { component: String, role: String },

    /// Detector models loaded
    ModelsLoaded {
        fingerprint: String,
        model_version: String,
    },

    /// Hysteresis threshold reached and the window classified
    AlertRaised {
        label: String,
        msg_count: usize,
        streak: u32,
        tags: String,
        /// false when the display policy hid this alert
        visible: bool,
    },

    /// Detector state cleared
    DetectorReset { reason: String },

    /// Vehicle model changed mode
    VehicleModeChange { from: String, to: String },

    /// Injector entered a new phase
    InjectorPhase { attack: String, phase: String },

    /// Periodic counters
    StatisticsSnapshot {
        windows: u64,
        anomalous_windows: u64,
        alerts: u64,
        lagged_frames: u64,
    },
}

/// A single entry in the log with tamper-resistant chaining
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityLogEntry {
    /// Position in the chain, starting at 0
    pub sequence: u64,

    /// Wall-clock time the entry was written
    pub timestamp: DateTime<Utc>,

    /// Component that generated this log entry
    pub component: String,

    pub event: SecurityEvent,

    /// `entry_hash` of the entry before this one, empty at the head
    pub prev_hash: String,

    /// SHA-256 over every other field
    pub entry_hash: String,
}

impl SecurityLogEntry {
    fn new(sequence: u64, component: String, event: SecurityEvent, prev_hash: String) -> Self {
        let timestamp = Utc::now();
        let entry_hash = compute_hash(sequence, &timestamp, &component, &event, &prev_hash);
        Self {
            sequence,
            timestamp,
            component,
            event,
            prev_hash,
            entry_hash,
        }
    }

    /// Recompute the hash and compare
    pub fn verify_hash(&self) -> bool {
        compute_hash(
            self.sequence,
            &self.timestamp,
            &self.component,
            &self.event,
            &self.prev_hash,
        ) == self.entry_hash
    }

    /// Whether this entry directly follows `prev_entry`
    pub fn verify_chain(&self, prev_entry: &SecurityLogEntry) -> bool {
        self.prev_hash == prev_entry.entry_hash && self.sequence == prev_entry.sequence + 1
    }
}

fn compute_hash(
    sequence: u64,
    timestamp: &DateTime<Utc>,
    component: &str,
    event: &SecurityEvent,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(component.as_bytes());
    hasher.update(serde_json::to_string(event).unwrap_or_default().as_bytes());
    hasher.update(prev_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct LogState {
    writer: BufWriter<File>,
    sequence: u64,
    last_hash: String,
}

/// Hash-chained JSONL logger. Clones share one file and one chain.
#[derive(Clone)]
pub struct SecurityLogger {
    component: String,
    log_path: PathBuf,
    state: Arc<Mutex<LogState>>,
}

impl SecurityLogger {
    /// Create a logger writing `<component>_<timestamp>.jsonl` under `log_dir`
    pub fn new(component: &str, log_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let log_path = log_dir.join(format!("{}_{}.jsonl", component, timestamp));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            component: component.to_string(),
            log_path,
            state: Arc::new(Mutex::new(LogState {
                writer: BufWriter::new(file),
                sequence: 0,
                last_hash: String::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        // a panic mid-write leaves the chain intact up to the last full entry
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event
    pub fn log_event(&self, event: SecurityEvent) {
        let mut state = self.lock();
        let entry = SecurityLogEntry::new(
            state.sequence,
            self.component.clone(),
            event,
            state.last_hash.clone(),
        );
        state.sequence += 1;
        state.last_hash = entry.entry_hash.clone();

        match serde_json::to_string(&entry) {
            Ok(json) => {
                if let Err(e) = writeln!(state.writer, "{}", json).and_then(|_| state.writer.flush())
                {
                    tracing::warn!(path = %self.log_path.display(), error = %e, "security log write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "security log entry not serializable"),
        }
    }

    pub fn log_startup(&self, role: &str) {
        self.log_event(SecurityEvent::SystemStartup {
            component: self.component.clone(),
            role: role.to_string(),
        });
    }

    pub fn log_models_loaded(&self, fingerprint: &str, model_version: &str) {
        self.log_event(SecurityEvent::ModelsLoaded {
            fingerprint: fingerprint.to_string(),
            model_version: model_version.to_string(),
        });
    }

    pub fn log_alert(&self, label: &str, msg_count: usize, streak: u32, tags: String, visible: bool) {
        self.log_event(SecurityEvent::AlertRaised {
            label: label.to_string(),
            msg_count,
            streak,
            tags,
            visible,
        });
    }

    pub fn log_detector_reset(&self, reason: &str) {
        self.log_event(SecurityEvent::DetectorReset {
            reason: reason.to_string(),
        });
    }

    pub fn log_mode_change(&self, from: &str, to: &str) {
        self.log_event(SecurityEvent::VehicleModeChange {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    pub fn log_injector_phase(&self, attack: &str, phase: &str) {
        self.log_event(SecurityEvent::InjectorPhase {
            attack: attack.to_string(),
            phase: phase.to_string(),
        });
    }

    pub fn log_statistics(&self, windows: u64, anomalous_windows: u64, alerts: u64, lagged_frames: u64) {
        self.log_event(SecurityEvent::StatisticsSnapshot {
            windows,
            anomalous_windows,
            alerts,
            lagged_frames,
        });
    }

    /// Get the log file path
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Next sequence number to be written
    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }
}

impl fmt::Debug for SecurityLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityLogger")
            .field("component", &self.component)
            .field("log_path", &self.log_path)
            .finish()
    }
}

/// Optional logger: a no-op when logging is disabled
pub fn open_optional(component: &str, log_dir: Option<&Path>) -> Option<SecurityLogger> {
    let dir = log_dir?;
    match SecurityLogger::new(component, dir) {
        Ok(logger) => {
            tracing::info!(path = %logger.log_path().display(), "security log enabled");
            Some(logger)
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "security log disabled");
            None
        }
    }
}

/// Walk a log file and check every hash and chain link in one pass
pub fn verify_log_file(log_path: &Path) -> Result<VerificationResult, String> {
    use std::io::{BufRead, BufReader};

    let file = File::open(log_path)
        .map_err(|e| format!("cannot open {}: {}", log_path.display(), e))?;

    let mut issues = Vec::new();
    let mut previous: Option<SecurityLogEntry> = None;
    let mut total_entries = 0usize;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| format!("line {}: {}", idx + 1, e))?;
        let entry: SecurityLogEntry =
            serde_json::from_str(&line).map_err(|e| format!("line {}: bad entry: {}", idx + 1, e))?;

        if !entry.verify_hash() {
            issues.push(format!("#{}: entry hash mismatch", idx));
        }
        if entry.sequence != idx as u64 {
            issues.push(format!("#{}: sequence {} out of place", idx, entry.sequence));
        }
        match &previous {
            None if !entry.prev_hash.is_empty() => {
                issues.push(format!("#0: chain starts at '{}' instead of nothing", entry.prev_hash));
            }
            Some(prev) if !entry.verify_chain(prev) => {
                issues.push(format!("#{}: broken link to the entry before it", idx));
            }
            _ => {}
        }

        total_entries += 1;
        previous = Some(entry);
    }

    Ok(VerificationResult {
        total_entries,
        verified: issues.is_empty(),
        issues,
    })
}

/// Outcome of [`verify_log_file`]
#[derive(Debug)]
pub struct VerificationResult {
    pub total_entries: usize,
    pub verified: bool,
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn alert() -> SecurityEvent {
        SecurityEvent::AlertRaised {
            label: "FLOODING / DOS".to_string(),
            msg_count: 1500,
            streak: 3,
            tags: "[SVM][AE:812.4]".to_string(),
            visible: true,
        }
    }

    #[test]
    fn test_fresh_entry_hash_matches_contents() {
        let entry = SecurityLogEntry::new(0, "live_ids".to_string(), alert(), String::new());
        assert!(entry.verify_hash());
    }

    #[test]
    fn test_entries_link_by_hash_and_sequence() {
        let first = SecurityLogEntry::new(
            0,
            "live_ids".to_string(),
            SecurityEvent::SystemStartup {
                component: "live_ids".to_string(),
                role: "detector".to_string(),
            },
            String::new(),
        );
        let second = SecurityLogEntry::new(1, "live_ids".to_string(), alert(), first.entry_hash.clone());
        assert!(second.verify_chain(&first));
        assert!(!first.verify_chain(&second));
    }

    #[test]
    fn test_written_log_verifies_clean() {
        let temp_dir = TempDir::new().unwrap();
        let logger = SecurityLogger::new("live_ids", temp_dir.path()).unwrap();

        logger.log_startup("detector");
        logger.log_models_loaded("ab12", "1");
        logger.log_alert("SPOOFING / REPLAY", 29, 3, "[AE:40.2]".to_string(), true);
        assert_eq!(logger.sequence(), 3);

        let result = verify_log_file(logger.log_path()).unwrap();
        assert_eq!(result.total_entries, 3);
        assert!(result.verified, "Log should be verified: {:?}", result.issues);
    }

    #[test]
    fn test_clones_share_one_chain() {
        let temp_dir = TempDir::new().unwrap();
        let logger = SecurityLogger::new("testbed", temp_dir.path()).unwrap();
        let other = logger.clone();

        logger.log_mode_change("CRUISING", "ANOMALY_REACTION");
        other.log_injector_phase("context_spoof", "INJECTING");
        logger.log_statistics(100, 7, 2, 0);

        let result = verify_log_file(logger.log_path()).unwrap();
        assert_eq!(result.total_entries, 3);
        assert!(result.verified, "{:?}", result.issues);
    }

    #[test]
    fn test_edited_event_breaks_the_hash() {
        let temp_dir = TempDir::new().unwrap();
        let logger = SecurityLogger::new("live_ids", temp_dir.path()).unwrap();
        logger.log_startup("detector");
        logger.log_alert("ANOMALY", 9, 3, "[SVM]".to_string(), false);

        // Hide the suppressed alert by flipping its visibility
        let content = fs::read_to_string(logger.log_path()).unwrap();
        fs::write(logger.log_path(), content.replace("\"visible\":false", "\"visible\":true")).unwrap();

        let result = verify_log_file(logger.log_path()).unwrap();
        assert!(!result.verified, "edited log still verified");
    }

    #[test]
    fn test_dropped_entry_breaks_chain() {
        let temp_dir = TempDir::new().unwrap();
        let logger = SecurityLogger::new("live_ids", temp_dir.path()).unwrap();
        for i in 0..3 {
            logger.log_detector_reset(&format!("reset {}", i));
        }
        let content = fs::read_to_string(logger.log_path()).unwrap();
        let kept: Vec<&str> = content.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        fs::write(logger.log_path(), kept.join("\n")).unwrap();

        let result = verify_log_file(logger.log_path()).unwrap();
        assert!(!result.verified);
        assert_eq!(result.total_entries, 2);
    }

    #[test]
    fn test_disabled_when_no_dir() {
        assert!(open_optional("live_ids", None).is_none());
    }
}
