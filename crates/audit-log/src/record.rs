use crate::{AuditError, Result};
use can_transport::{CanFrame, CanId};
use core::fmt;
use drive_protocol::{Command, Direction, Telemetry};
use std::io::BufRead;

/// First line of every log file.
pub const HEADER: &str = "Time(ms),Dir,ID,Len,B0,B1,B2,B3,B4,B5,B6,B7,Decoded";

const BYTE_COLUMNS: usize = 8;
const FIELDS: usize = 4 + BYTE_COLUMNS + 1;

/// Typed meaning of a logged frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decoded {
    Command(Command),
    Telemetry(Telemetry),
}

impl fmt::Display for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decoded::Command(cmd) => cmd.fmt(f),
            Decoded::Telemetry(t) => t.fmt(f),
        }
    }
}

/// One appended audit record. Append order is causal order.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub direction: Direction,
    pub frame: CanFrame,
    pub decoded: Decoded,
    pub note: Option<String>,
}

impl LogEntry {
    pub fn outbound(timestamp_ms: u64, frame: CanFrame, cmd: Command) -> Self {
        Self {
            timestamp_ms,
            direction: Direction::Outbound,
            frame,
            decoded: Decoded::Command(cmd),
            note: None,
        }
    }

    pub fn inbound(timestamp_ms: u64, frame: CanFrame, telemetry: Telemetry) -> Self {
        Self {
            timestamp_ms,
            direction: Direction::Inbound,
            frame,
            decoded: Decoded::Telemetry(telemetry),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Text of the `Decoded` column.
    pub fn text(&self) -> String {
        match &self.note {
            Some(note) => format!("{} ({note})", self.decoded),
            None => self.decoded.to_string(),
        }
    }
}

/// Render one CSV line (without terminator).
pub fn format_record(entry: &LogEntry) -> String {
    let frame = &entry.frame;
    let mut line = format!(
        "{},{},0x{:03X},{}",
        entry.timestamp_ms,
        entry.direction,
        frame.id.raw(),
        frame.len
    );
    let payload = frame.payload();
    for i in 0..BYTE_COLUMNS {
        line.push(',');
        if let Some(b) = payload.get(i) {
            line.push_str(&format!("0x{b:02X}"));
        }
    }
    line.push(',');
    line.push_str(&quote(&entry.text()));
    line
}

// Double embedded quotes; a run of CR/LF becomes one space.
fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    let mut in_break = false;
    for c in text.chars() {
        if c == '\r' || c == '\n' {
            if !in_break {
                out.push(' ');
            }
            in_break = true;
            continue;
        }
        in_break = false;
        if c == '"' {
            out.push_str("\"\"");
        } else {
            out.push(c);
        }
    }
    out.push('"');
    out
}

/// A log line read back from storage.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub line: usize,
    pub timestamp_ms: u64,
    pub direction: Direction,
    pub frame: CanFrame,
    pub text: String,
}

pub fn parse_record(line_no: usize, line: &str) -> Result<LogRecord> {
    let err = |reason| AuditError::Parse {
        line: line_no,
        reason,
    };
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).splitn(FIELDS, ',').collect();
    if fields.len() != FIELDS {
        return Err(err("wrong column count"));
    }
    let timestamp_ms = fields[0].parse::<u64>().map_err(|_| err("timestamp"))?;
    let direction = match fields[1] {
        "TX" => Direction::Outbound,
        "RX" => Direction::Inbound,
        _ => return Err(err("direction")),
    };
    let id = fields[2]
        .strip_prefix("0x")
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .and_then(CanId::from_raw)
        .ok_or_else(|| err("identifier"))?;
    let len = fields[3]
        .parse::<usize>()
        .ok()
        .filter(|l| *l <= BYTE_COLUMNS)
        .ok_or_else(|| err("length"))?;
    let mut data = Vec::with_capacity(len);
    for col in &fields[4..4 + len] {
        let byte = col
            .strip_prefix("0x")
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(|| err("data byte"))?;
        data.push(byte);
    }
    let quoted = fields[FIELDS - 1];
    let text = quoted
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| err("decoded text"))?
        .replace("\"\"", "\"");
    let frame = CanFrame::new(id, &data).ok_or_else(|| err("length"))?;
    Ok(LogRecord {
        line: line_no,
        timestamp_ms,
        direction,
        frame,
        text,
    })
}

/// Parse every record of a log file, skipping the header and blank lines.
pub fn read_records<R: BufRead>(reader: R) -> impl Iterator<Item = Result<LogRecord>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| match line {
            Ok(l) if l.trim().is_empty() || l.trim_end() == HEADER => None,
            Ok(l) => Some(parse_record(idx + 1, &l)),
            Err(e) => Some(Err(AuditError::Io(e))),
        })
}
