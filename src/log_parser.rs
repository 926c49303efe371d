/// Raw traffic log parsing
///
/// Reads candump-style lines, `(1712345678.123456) vcan0 123#22600000`,
/// into labelled records and cuts them into the same feature rows the live
/// detector computes.
use crate::can_bus::{BusSubscription, Received};
use crate::errors::DataError;
use crate::features::FeatureVector;
use crate::stop::StopSignal;
use crate::types::{CanFrame, CanId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::time::Duration;

pub const LABEL_BENIGN: u8 = 0;
pub const LABEL_ATTACK: u8 = 1;

pub const TYPE_FLOOD: &str = "attack_flood";
pub const TYPE_FUZZ: &str = "attack_fuzz";
pub const TYPE_CONTEXT_SPOOF: &str = "context_spoof_injected";

/// Arbitration id (uppercase hex, as logged) to sender label
pub fn ecu_type(arbitration_id: &str) -> Option<&'static str> {
    match arbitration_id {
        "123" => Some("ecu_engine_rpm"),
        "240" => Some("ecu_abs_status"),
        "310" => Some("ecu_transmission"),
        "4F0" => Some("ecu_infotainment"),
        "500" => Some("ecu_body_control"),
        "000" => Some(TYPE_FLOOD),
        _ => None,
    }
}

/// One parsed log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub timestamp: f64,
    pub arbitration_id: String,
    pub data_hex: String,
    pub label: u8,
    #[serde(rename = "type")]
    pub kind: String,
}

impl TrafficRecord {
    pub fn is_attack(&self) -> bool {
        self.label == LABEL_ATTACK
    }

    pub fn to_frame(&self) -> Option<CanFrame> {
        let id = u32::from_str_radix(&self.arbitration_id, 16).ok()?;
        let data = decode_hex(&self.data_hex)?;
        Some(CanFrame::new(
            CanId::from_raw(id),
            data,
            self.kind.clone(),
            self.timestamp,
        ))
    }
}

/// Context-spoof frames cannot be told apart by id, so they are labelled
/// by time: gear frames inside `[start, end]` seconds after the first
/// record are marked as injected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpoofSpan {
    pub start: f64,
    pub end: f64,
}

impl SpoofSpan {
    pub const GEAR_ID: &'static str = "310";

    /// Attack phase of the default orchestrated scenario
    pub fn default_scenario() -> Self {
        Self {
            start: 15.0,
            end: 30.0,
        }
    }
}

impl std::str::FromStr for SpoofSpan {
    type Err = String;

    /// `"START,END"` in seconds
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once(',')
            .ok_or_else(|| format!("expected START,END, got '{}'", s))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number of seconds", v.trim()))
        };
        let span = Self {
            start: parse(start)?,
            end: parse(end)?,
        };
        if span.end < span.start {
            return Err(format!("span ends at {} before it starts at {}", span.end, span.start));
        }
        Ok(span)
    }
}

/// Parse one line. Flood and unknown ids are labelled as attacks here;
/// spoof labelling needs the whole log and happens in `parse_log`.
pub fn parse_line(line: &str, line_no: usize) -> Result<TrafficRecord, DataError> {
    let malformed = |reason: &str| DataError::MalformedLine {
        line_no,
        reason: reason.to_string(),
    };

    let line = line.trim();
    let rest = line.strip_prefix('(').ok_or_else(|| malformed("missing timestamp"))?;
    let (ts, rest) = rest
        .split_once(')')
        .ok_or_else(|| malformed("unterminated timestamp"))?;
    let timestamp: f64 = ts.parse().map_err(|_| malformed("bad timestamp"))?;

    let mut fields = rest.split_whitespace();
    let _interface = fields.next().ok_or_else(|| malformed("missing interface"))?;
    let frame = fields.next().ok_or_else(|| malformed("missing frame"))?;
    let (id, data) = frame
        .split_once('#')
        .ok_or_else(|| malformed("frame has no '#'"))?;

    let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());
    if id.is_empty() || !is_hex(id) {
        return Err(malformed("bad arbitration id"));
    }
    if !is_hex(data) || data.len() % 2 != 0 || data.len() > 16 {
        return Err(malformed("bad payload"));
    }

    let arbitration_id = id.to_ascii_uppercase();
    let (label, kind) = match ecu_type(&arbitration_id) {
        Some(TYPE_FLOOD) => (LABEL_ATTACK, TYPE_FLOOD),
        Some(name) => (LABEL_BENIGN, name),
        None => (LABEL_ATTACK, TYPE_FUZZ),
    };

    Ok(TrafficRecord {
        timestamp,
        arbitration_id,
        data_hex: data.to_ascii_uppercase(),
        label,
        kind: kind.to_string(),
    })
}

/// Result of parsing a whole log
#[derive(Debug, Default)]
pub struct ParsedLog {
    pub records: Vec<TrafficRecord>,
    /// Malformed lines, skipped
    pub skipped: usize,
}

impl ParsedLog {
    pub fn attack_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_attack()).count()
    }

    pub fn benign_count(&self) -> usize {
        self.records.len() - self.attack_count()
    }
}

pub fn parse_log<R: BufRead>(reader: R, spoof_span: Option<SpoofSpan>) -> std::io::Result<ParsedLog> {
    let mut parsed = ParsedLog::default();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line, i + 1) {
            Ok(record) => parsed.records.push(record),
            Err(e) => {
                tracing::debug!(error = %e, "skipping log line");
                parsed.skipped += 1;
            }
        }
    }

    if let Some(span) = spoof_span {
        label_spoof_span(&mut parsed.records, span);
    }
    Ok(parsed)
}

fn label_spoof_span(records: &mut [TrafficRecord], span: SpoofSpan) {
    let Some(first) = records.iter().map(|r| r.timestamp).min_by(|a, b| a.total_cmp(b)) else {
        return;
    };
    let (start, end) = (first + span.start, first + span.end);
    for record in records.iter_mut() {
        if record.arbitration_id == SpoofSpan::GEAR_ID
            && record.timestamp >= start
            && record.timestamp <= end
        {
            record.label = LABEL_ATTACK;
            record.kind = TYPE_CONTEXT_SPOOF.to_string();
        }
    }
}

/// Feature row for one offline window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRow {
    pub window_start: f64,
    #[serde(flatten)]
    pub features: FeatureVector,
    /// Attack if any frame in the window is
    pub label: u8,
}

/// Cut records into back-to-back windows anchored at the first timestamp.
/// Empty windows produce no row.
pub fn windowed_features(records: &[TrafficRecord], length: Duration) -> Vec<FeatureRow> {
    let length = length.as_secs_f64();
    let Some(origin) = records
        .iter()
        .map(|r| r.timestamp)
        .min_by(|a, b| a.total_cmp(b))
    else {
        return Vec::new();
    };
    if length <= 0.0 {
        return Vec::new();
    }

    let mut windows: BTreeMap<u64, (Vec<CanFrame>, bool)> = BTreeMap::new();
    for record in records {
        let Some(frame) = record.to_frame() else {
            continue;
        };
        let index = ((record.timestamp - origin) / length).floor() as u64;
        let entry = windows.entry(index).or_default();
        entry.0.push(frame);
        entry.1 |= record.is_attack();
    }

    windows
        .into_iter()
        .filter_map(|(index, (frames, attack))| {
            FeatureVector::from_frames(&frames).map(|features| FeatureRow {
                window_start: origin + index as f64 * length,
                features,
                label: if attack { LABEL_ATTACK } else { LABEL_BENIGN },
            })
        })
        .collect()
}

/// Format a frame as one raw log line
pub fn format_line(frame: &CanFrame, interface: &str, wall_clock: f64) -> String {
    format!(
        "({:.6}) {} {}#{}",
        wall_clock,
        interface,
        frame.id,
        frame.data_hex()
    )
}

/// Append every frame seen on `subscription` to `out` as raw log lines,
/// stamped with wall-clock time, until stopped or the bus closes.
/// Returns the number of lines written.
pub async fn record_traffic<W: Write>(
    mut subscription: BusSubscription,
    mut out: W,
    interface: &str,
    stop: StopSignal,
) -> std::io::Result<u64> {
    let mut written = 0u64;
    while !stop.is_stopped() {
        match subscription.recv_timeout(Duration::from_millis(100)).await {
            Received::Frame(frame) => {
                let wall_clock = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
                writeln!(out, "{}", format_line(&frame, interface, wall_clock))?;
                written += 1;
            }
            Received::Timeout => out.flush()?,
            Received::Closed => break,
        }
    }
    out.flush()?;
    tracing::debug!(lines = written, "traffic recorder stopped");
    Ok(written)
}

/// Write JSON lines, one per item
pub fn write_jsonl<W: Write, T: Serialize>(mut out: W, items: &[T]) -> std::io::Result<()> {
    for item in items {
        serde_json::to_writer(&mut out, item)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::can_ids;

    const LOG: &str = "\
(100.000000) vcan0 123#22600000
(100.020000) vcan0 310#05000000
not a frame line
(100.040000) vcan0 000#0000000000000000
(100.060000) vcan0 7AB#DEAD
(100.080000) vcan0 240#GG00
(120.000000) vcan0 310#02000000
";

    #[test]
    fn test_parse_line_fields() {
        let record = parse_line("(1712345678.123456) vcan0 4f0#0a0B", 1).unwrap();
        assert_eq!(record.timestamp, 1712345678.123456);
        assert_eq!(record.arbitration_id, "4F0");
        assert_eq!(record.data_hex, "0A0B");
        assert_eq!(record.label, LABEL_BENIGN);
        assert_eq!(record.kind, "ecu_infotainment");
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let record = parse_line("(1.5) can0 500#", 1).unwrap();
        assert_eq!(record.data_hex, "");
        assert_eq!(record.to_frame().unwrap().data, Vec::<u8>::new());
    }

    #[test]
    fn test_malformed_lines_are_skipped_and_counted() {
        let parsed = parse_log(LOG.as_bytes(), None).unwrap();
        assert_eq!(parsed.records.len(), 5);
        assert_eq!(parsed.skipped, 2);

        assert!(matches!(
            parse_line("(abc) vcan0 123#00", 7),
            Err(DataError::MalformedLine { line_no: 7, .. })
        ));
    }

    #[test]
    fn test_flood_and_fuzz_labels() {
        let parsed = parse_log(LOG.as_bytes(), None).unwrap();
        let kinds: Vec<&str> = parsed.records.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "ecu_engine_rpm",
                "ecu_transmission",
                TYPE_FLOOD,
                TYPE_FUZZ,
                "ecu_transmission"
            ]
        );
        assert_eq!(parsed.attack_count(), 2);
        assert_eq!(parsed.benign_count(), 3);
    }

    #[test]
    fn test_spoof_span_labels_only_gear_frames() {
        let parsed = parse_log(LOG.as_bytes(), Some(SpoofSpan::default_scenario())).unwrap();
        let late_gear = parsed.records.last().unwrap();
        assert_eq!(late_gear.kind, TYPE_CONTEXT_SPOOF);
        assert!(late_gear.is_attack());

        // gear frame at t0 + 0.02 is outside the span
        assert_eq!(parsed.records[1].kind, "ecu_transmission");
        assert_eq!(parsed.attack_count(), 3);
    }

    #[test]
    fn test_windowed_features_match_live_extractor() {
        let parsed = parse_log(LOG.as_bytes(), None).unwrap();
        let rows = windowed_features(&parsed.records, Duration::from_millis(100));
        assert_eq!(rows.len(), 2, "two non-empty windows, the gap is skipped");

        let first = &rows[0];
        assert_eq!(first.features.msg_count, 4);
        assert_eq!(first.features.unique_ids, 4);
        assert!((first.features.id_entropy - 2.0).abs() < 1e-12);
        assert!((first.features.iat_mean - 0.02).abs() < 1e-9);
        assert_eq!(first.label, LABEL_ATTACK);

        assert_eq!(rows[1].features.msg_count, 1);
        assert_eq!(rows[1].label, LABEL_BENIGN);
        assert!((rows[1].window_start - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_format_line_parses_back() {
        let frame = CanFrame::new(can_ids::TRANSMISSION, vec![2, 0, 0, 0], "spoof".into(), 3.0);
        let line = format_line(&frame, "vcan0", 1700000000.25);
        assert_eq!(line, "(1700000000.250000) vcan0 310#02000000");
        let record = parse_line(&line, 1).unwrap();
        assert_eq!(record.to_frame().unwrap().data, frame.data);
    }

    #[test]
    fn test_feature_rows_serialize_flat() {
        let rows = vec![FeatureRow {
            window_start: 0.0,
            features: FeatureVector::default(),
            label: 1,
        }];
        let mut out = Vec::new();
        write_jsonl(&mut out, &rows).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"msg_count\":0") && text.contains("\"label\":1"));
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_recorded_traffic_parses_back() {
        let bus = crate::can_bus::VirtualCanBus::new(16);
        let subscription = bus.subscribe().unwrap();
        let sender = bus.attach_sender("ECU_ENGINE").unwrap();
        sender.send(can_ids::ENGINE_RPM, vec![0x08, 0x98]).unwrap();
        sender.send(can_ids::TRANSMISSION, vec![0x03]).unwrap();
        bus.shutdown();

        let mut out = Vec::new();
        let written = record_traffic(subscription, &mut out, "vcan0", StopSignal::new())
            .await
            .unwrap();
        assert_eq!(written, 2);

        let parsed = parse_log(out.as_slice(), None).unwrap();
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.records[0].kind, "ecu_engine_rpm");
        assert_eq!(parsed.records[0].data_hex, "0898");
        assert_eq!(parsed.records[1].arbitration_id, "310");
        assert!(parsed.records[0].timestamp <= parsed.records[1].timestamp);
    }

    #[test]
    fn test_spoof_span_from_str() {
        assert_eq!("15,30".parse::<SpoofSpan>().unwrap(), SpoofSpan::default_scenario());
        assert_eq!(
            " 2.5 , 4 ".parse::<SpoofSpan>().unwrap(),
            SpoofSpan { start: 2.5, end: 4.0 }
        );
        assert!("30,15".parse::<SpoofSpan>().is_err());
        assert!("15".parse::<SpoofSpan>().is_err());
        assert!("a,b".parse::<SpoofSpan>().is_err());
    }
}
