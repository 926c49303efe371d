/// Dashboard line contract
///
/// The simulation prints one status line per control tick and the detector
/// prints one alert line per alert. Dashboards tail stdout and parse these
/// with the helpers below, so the tokens must not change.
use crate::anomaly_detection::{AttackLabel, DetectionResult};
use crate::vehicle::VehicleMode;
use colored::*;
use serde::Serialize;

pub const ALERT_MARKER: &str = "🚨 ALERT:";
const UNKNOWN_GEAR: &str = "???";
/// Lines inspected by `flooding_active`
const RECENT_LINES: usize = 20;

/// `STATE:<MODE>|RPM:<int>|GEAR:<int or ???>|RATE:<int>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    pub mode: VehicleMode,
    pub rpm: u16,
    /// `None` when the gear signal is stale or was never seen
    pub gear: Option<u8>,
    pub rate: u64,
}

impl StatusLine {
    pub fn render(&self) -> String {
        format!(
            "STATE:{}|RPM:{}|GEAR:{}|RATE:{}",
            self.mode,
            self.rpm,
            self.gear_token(),
            self.rate
        )
    }

    /// In-place terminal view; flags the bus load above `flood_warning` msg/s
    pub fn render_terminal(&self, flood_warning: u64) -> String {
        let mode = format!("[{:<16}]", self.mode.as_str());
        let mode = match self.mode {
            VehicleMode::AnomalyReaction => mode.red().bold(),
            VehicleMode::Braking => mode.yellow(),
            _ => mode.cyan(),
        };
        let rate = if self.rate > flood_warning {
            format!("🔥 {} msg/s (FLOOD!)", self.rate).red().bold()
        } else {
            format!("{} msg/s", self.rate).normal()
        };
        format!(
            "{} RPM: {:4} | Gear: {:<3} | {}",
            mode,
            self.rpm,
            self.gear_token(),
            rate
        )
    }

    fn gear_token(&self) -> String {
        match self.gear {
            Some(g) => g.to_string(),
            None => UNKNOWN_GEAR.to_string(),
        }
    }
}

/// `🚨 ALERT: <LABEL> | Vol: <msgCount> | <tags>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertLine {
    pub label: AttackLabel,
    pub msg_count: usize,
    pub tags: String,
}

impl AlertLine {
    pub fn from_result(result: &DetectionResult) -> Self {
        Self {
            label: result.label,
            msg_count: result.msg_count,
            tags: result.tags(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{} {} | Vol: {} | {}",
            ALERT_MARKER, self.label, self.msg_count, self.tags
        )
    }
}

/// Terminal-mode detector line for a window that did not alert
pub fn render_quiet_window(result: &DetectionResult) -> String {
    if result.streak > 0 {
        format!(
            "{} | Vol: {:<4} | {}",
            format!("⚠️  {:<24}", "CHECKING...").yellow(),
            result.msg_count,
            result.tags()
        )
    } else {
        format!(
            "{} | Vol: {:<4} | AE: {:.4}",
            format!("🟢 {:<24}", "NORMAL").green(),
            result.msg_count,
            result.reconstruction_error
        )
    }
}

/// Terminal-mode alert line (padded label)
pub fn render_alert_terminal(alert: &AlertLine) -> String {
    format!(
        "{} {:<18} | Vol: {:<4} | {}",
        ALERT_MARKER,
        alert.label.as_str(),
        alert.msg_count,
        alert.tags
    )
    .red()
    .bold()
    .to_string()
}

/// Parse an alert line. Anything before the marker (e.g. an `[IDS]`
/// process prefix) is ignored.
pub fn parse_alert_line(line: &str) -> Option<AlertLine> {
    let (_, rest) = line.split_once(ALERT_MARKER)?;
    let mut parts = rest.splitn(3, '|');
    let label = AttackLabel::from_label(parts.next()?.trim())?;
    let msg_count = parts
        .next()?
        .trim()
        .strip_prefix("Vol:")?
        .trim()
        .parse()
        .ok()?;
    let tags = parts.next().unwrap_or("").trim().to_string();
    Some(AlertLine {
        label,
        msg_count,
        tags,
    })
}

pub fn parse_status_line(line: &str) -> Option<StatusLine> {
    let start = line.find("STATE:")?;
    let mut mode = None;
    let mut rpm = None;
    let mut gear = None;
    let mut rate = None;

    for field in line[start..].trim().split('|') {
        let (key, value) = field.split_once(':')?;
        let value = value.trim();
        match key.trim() {
            "STATE" => mode = VehicleMode::from_token(value),
            "RPM" => rpm = value.parse().ok(),
            "GEAR" if value == UNKNOWN_GEAR => gear = Some(None),
            "GEAR" => gear = value.parse().ok().map(Some),
            "RATE" => rate = value.parse().ok(),
            _ => {}
        }
    }

    Some(StatusLine {
        mode: mode?,
        rpm: rpm?,
        gear: gear?,
        rate: rate?,
    })
}

/// Most recent parseable status line
pub fn latest_vehicle_state<S: AsRef<str>>(lines: &[S]) -> Option<StatusLine> {
    lines
        .iter()
        .rev()
        .find_map(|line| parse_status_line(line.as_ref()))
}

/// A flood is active if, among the recent lines, a FLOODING alert was seen
/// more recently than a NORMAL line.
pub fn flooding_active<S: AsRef<str>>(lines: &[S]) -> bool {
    let recent = &lines[lines.len().saturating_sub(RECENT_LINES)..];
    for line in recent.iter().rev() {
        let line = line.as_ref();
        if line.contains("FLOODING") {
            return true;
        }
        if line.contains("NORMAL") {
            return false;
        }
    }
    false
}
