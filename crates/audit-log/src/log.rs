use crate::{format_record, next_log_name, LogEntry, LogSink, LogStore, Result, HEADER};
use std::io::Write;
use tracing::{debug, info};

/// Single-writer, append-only audit trail.
pub struct AuditLog {
    sink: Box<dyn LogSink>,
    written: u64,
    unflushed: usize,
}

impl AuditLog {
    /// Probe for the next free `prefix_NNNN.csv`, create it and write the header.
    pub fn open(store: &mut dyn LogStore, prefix: &str) -> Result<Self> {
        let name = next_log_name(store, prefix)?;
        let sink = store.open(&name)?;
        let log = Self::with_sink(sink)?;
        info!(file = %name, "audit log opened");
        Ok(log)
    }

    pub fn with_sink(mut sink: Box<dyn LogSink>) -> Result<Self> {
        sink.append_line(HEADER)?;
        sink.flush()?;
        Ok(Self {
            sink,
            written: 0,
            unflushed: 0,
        })
    }

    pub fn file_name(&self) -> &str {
        self.sink.name()
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        self.sink.append_line(&format_record(entry))?;
        self.written += 1;
        self.unflushed += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.unflushed > 0 {
            self.sink.flush()?;
            debug!(entries = self.unflushed, "audit log flushed");
            self.unflushed = 0;
        }
        Ok(())
    }

    /// Flush and copy the whole file, header included, to `out`.
    pub fn dump(&mut self, out: &mut dyn Write) -> Result<usize> {
        self.flush()?;
        let bytes = self.sink.read_back()?;
        out.write_all(&bytes)?;
        out.flush()?;
        Ok(bytes.len())
    }

    pub fn entries_written(&self) -> u64 {
        self.written
    }

    pub fn unflushed(&self) -> usize {
        self.unflushed
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        if let Err(e) = self.sink.flush() {
            tracing::error!(file = %self.sink.name(), "final audit flush failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_records, MemoryStore};
    use can_transport::CanId;
    use drive_protocol::{encode, Command};

    fn entry(ts: u64, cmd: Command) -> LogEntry {
        LogEntry::outbound(ts, encode(cmd).to_can(CanId::standard(0x201).unwrap()), cmd)
    }

    #[test]
    fn header_is_durable_before_any_entry() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        let log = AuditLog::open(&mut store, "run")?;
        assert_eq!(log.file_name(), "run_0001.csv");
        assert_eq!(store.contents("run_0001.csv").as_deref(), Some(format!("{HEADER}\r\n").as_str()));
        Ok(())
    }

    #[test]
    fn entries_reach_storage_on_flush() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        let mut log = AuditLog::open(&mut store, "run")?;
        log.append(&entry(1, Command::ClearErrors))?;
        log.append(&entry(2, Command::SetArmed(false)))?;
        assert_eq!(log.unflushed(), 2);
        assert_eq!(store.contents("run_0001.csv").map(|c| c.lines().count()), Some(1));

        log.flush()?;
        let text = store.contents("run_0001.csv").unwrap_or_default();
        let records: Vec<_> = read_records(text.as_bytes()).collect::<crate::Result<_>>()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].text, "Lock/Disable drive");
        assert_eq!(log.entries_written(), 2);
        Ok(())
    }

    #[test]
    fn dump_copies_everything_in_order() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        let mut log = AuditLog::open(&mut store, "run")?;
        log.append(&entry(5, Command::SetTorque(0)))?;
        let mut out = Vec::new();
        log.dump(&mut out)?;
        let text = String::from_utf8(out)?;
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(HEADER));
        assert!(lines.next().is_some_and(|l| l.ends_with("\"Set torque = 0\"")));
        Ok(())
    }

    #[test]
    fn second_run_gets_a_new_file() -> anyhow::Result<()> {
        let mut store = MemoryStore::new();
        let first = AuditLog::open(&mut store, "run")?;
        let second = AuditLog::open(&mut store, "run")?;
        assert_ne!(first.file_name(), second.file_name());
        Ok(())
    }
}
