//! Per-rank trace writer (spec §6: "per-rank gzip-compressed event log...
//! not required for correctness; see Trace component").
//!
//! An interface plus the one minimal concrete writer the core itself
//! needs — trace *analysis* tooling is out of scope (spec's "external
//! collaborators" list names the trace writer as an interface, not an
//! analyzer). [`crate::messenger::ActiveMessenger`] calls the begin/end
//! processing and message-create/message-recv hooks; nothing else in the
//! crate reads trace output back.

use std::fs::File;
use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::handler_id::HandlerId;
use crate::types::RankId;

/// One recorded trace event (spec §6: "begin/end processing,
/// message-create, message-recv events").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    BeginProcessing { handler: HandlerId, from: RankId },
    EndProcessing { handler: HandlerId },
    MessageCreate { handler: HandlerId, bytes: usize },
    MessageRecv { handler: HandlerId, from: RankId, bytes: usize },
}

/// Sink for trace events. `timestamp` is handed in by the caller rather
/// than read from the system clock here, so the writer itself stays
/// deterministic and easy to unit test.
pub trait TraceWriter {
    fn record(&mut self, timestamp_ns: u64, event: TraceEvent) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Discards every event. Default when `RuntimeConfig::trace_path` is
/// `None` (spec: tracing is optional, "not required for correctness").
pub struct NullTracer;

impl TraceWriter for NullTracer {
    fn record(&mut self, _: u64, _: TraceEvent) -> io::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Gzip-compressed, newline-delimited text event log (spec: "gzip-compressed
/// event log"), one file per rank. A human-readable side-channel rather
/// than a binary trace format, since no downstream trace-analysis tool is
/// in scope to dictate one.
pub struct FileTracer {
    out: GzEncoder<File>,
}

impl FileTracer {
    pub fn create(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(FileTracer {
            out: GzEncoder::new(file, Compression::default()),
        })
    }
}

impl TraceWriter for FileTracer {
    fn record(&mut self, timestamp_ns: u64, event: TraceEvent) -> io::Result<()> {
        match event {
            TraceEvent::BeginProcessing { handler, from } => {
                writeln!(self.out, "{timestamp_ns},begin,{handler:?},{from}")
            }
            TraceEvent::EndProcessing { handler } => {
                writeln!(self.out, "{timestamp_ns},end,{handler:?}")
            }
            TraceEvent::MessageCreate { handler, bytes } => {
                writeln!(self.out, "{timestamp_ns},create,{handler:?},{bytes}")
            }
            TraceEvent::MessageRecv { handler, from, bytes } => {
                writeln!(self.out, "{timestamp_ns},recv,{handler:?},{from},{bytes}")
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_tracer_discards_everything() {
        let mut t = NullTracer;
        let handler = HandlerId::new_local(RankId::new(0), 0, false);
        assert!(t
            .record(0, TraceEvent::EndProcessing { handler })
            .is_ok());
        assert!(t.flush().is_ok());
    }

    #[test]
    fn file_tracer_writes_and_flushes_without_error() {
        let dir = std::env::temp_dir().join(format!("amt-trace-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rank0.trace.gz");
        let handler = HandlerId::new_local(RankId::new(0), 3, false);
        {
            let mut t = FileTracer::create(&path).unwrap();
            t.record(
                1,
                TraceEvent::BeginProcessing {
                    handler,
                    from: RankId::new(1),
                },
            )
            .unwrap();
            t.record(2, TraceEvent::EndProcessing { handler }).unwrap();
            t.flush().unwrap();
        }
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        std::fs::remove_dir_all(&dir).ok();
    }
}
