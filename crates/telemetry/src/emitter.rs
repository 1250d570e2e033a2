//! JSON Lines emission: one record per line, newline-terminated, buffered.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::record::TelemetryRecord;

pub struct JsonLinesEmitter {
    writer: BufWriter<Box<dyn Write + Send>>,
    /// A second handle onto the same file, for fsync.
    sync_handle: Option<File>,
    sync_on_write: bool,
    emitted: u64,
}

impl JsonLinesEmitter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: BufWriter::new(writer),
            sync_handle: None,
            sync_on_write: false,
            emitted: 0,
        }
    }

    /// Emit to a file, optionally flushing and fsyncing after every record.
    pub fn for_file(file: File, sync_on_write: bool) -> std::io::Result<Self> {
        let sync_handle = sync_on_write.then(|| file.try_clone()).transpose()?;
        Ok(Self {
            writer: BufWriter::new(Box::new(file)),
            sync_handle,
            sync_on_write,
            emitted: 0,
        })
    }

    /// Serialize one record as a single line. JSON string escaping guarantees
    /// no embedded newlines survive serialization.
    pub fn emit(&mut self, record: &TelemetryRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)?;
        debug_assert!(!line.contains('\n'));
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.emitted += 1;

        if self.sync_on_write {
            self.writer.flush()?;
            if let Some(handle) = &self.sync_handle {
                handle.sync_all()?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    use crate::record::tests::sample_result;
    use crate::record::{OpLogRecord, TelemetryRecord};

    /// A Write sink the test can read back.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn op_log() -> TelemetryRecord {
        TelemetryRecord::OpLog(OpLogRecord::new(sample_result()))
    }

    #[test]
    fn one_record_per_line() {
        let buf = SharedBuf::default();
        let mut emitter = JsonLinesEmitter::new(Box::new(buf.clone()));
        emitter.emit(&op_log()).unwrap();
        emitter.emit(&op_log()).unwrap();
        emitter.flush().unwrap();

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.trim_end().split('\n').collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["type"], "op_log");
        }
        assert_eq!(emitter.emitted(), 2);
    }

    #[test]
    fn embedded_newlines_are_escaped() {
        let mut result = sample_result();
        result.outcome.error = Some(drill_domain::outcome::ErrorInfo::transport(
            "line one\nline two",
        ));
        result.outcome.ok = false;
        let record = TelemetryRecord::OpLog(OpLogRecord::new(result));

        let buf = SharedBuf::default();
        let mut emitter = JsonLinesEmitter::new(Box::new(buf.clone()));
        emitter.emit(&record).unwrap();
        emitter.flush().unwrap();

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        // Exactly one newline: the terminator.
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn file_emitter_with_sync_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        let file = File::create(&path).unwrap();
        let mut emitter = JsonLinesEmitter::for_file(file, true).unwrap();
        emitter.emit(&op_log()).unwrap();
        // sync_on_write flushed without an explicit flush() call.

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(contents.trim_end()).unwrap();
        assert_eq!(value["format"], "op-log/v1");
    }

    #[test]
    fn parse_serialize_parse_fixed_point() {
        let record = op_log();
        let first = serde_json::to_string(&record).unwrap();
        let reparsed: TelemetryRecord = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&reparsed).unwrap();
        let a: serde_json::Value = serde_json::from_str(&first).unwrap();
        let b: serde_json::Value = serde_json::from_str(&second).unwrap();
        assert_eq!(a, b);
    }
}
