//! Per-rank stats file writer (spec §6 "Persisted state / file formats").
//!
//! Written at phase boundaries in the CSV-style record format the spec
//! dictates verbatim, so external load-balancing tooling (outside this
//! crate's scope, per the Non-goals) can consume it unchanged. Mirrors the
//! shape of [`crate::trace::TraceWriter`]: an interface plus the one
//! concrete writer the core itself needs, with no analysis tooling built
//! on top.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::location::EntityId;

/// Category of a recorded communication edge (spec §6, categories 1-8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommCategory {
    SendRecv = 1,
    CollectionToNode = 2,
    NodeToCollection = 3,
    Broadcast = 4,
    CollectionToNodeBcast = 5,
    NodeToCollectionBcast = 6,
    CollectiveToCollectionBcast = 7,
    LocalInvoke = 8,
}

/// One entity's load record for a phase (spec §6 first record shape).
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRecord {
    pub entity_id: EntityId,
    pub whole_phase_load: f64,
    pub subphases: Vec<f64>,
}

/// One communication edge recorded for a phase (spec §6 second record
/// shape).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommRecord {
    pub to_id: EntityId,
    pub from_id: EntityId,
    pub bytes: u64,
    pub category: CommCategory,
}

/// Destination for a rank's stats output. The core never reads its own
/// stats file back; `StatsWriter` is write-only, matching the trace
/// writer's "interface plus minimal concrete writer" shape.
pub trait StatsWriter {
    fn write_phase(
        &mut self,
        phase: u64,
        loads: &[LoadRecord],
        comms: &[CommRecord],
    ) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Discards every record. Default when `RuntimeConfig::stats_path` is
/// `None` (spec: stats are optional).
pub struct NullStats;

impl StatsWriter for NullStats {
    fn write_phase(&mut self, _: u64, _: &[LoadRecord], _: &[CommRecord]) -> io::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Plain-text CSV writer, one file per rank, appended to as phases
/// complete (spec: "newline-separated... phases are dense integers
/// starting at 0").
pub struct FileStats {
    out: BufWriter<File>,
}

impl FileStats {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(FileStats {
            out: BufWriter::new(File::create(path)?),
        })
    }
}

impl StatsWriter for FileStats {
    fn write_phase(
        &mut self,
        phase: u64,
        loads: &[LoadRecord],
        comms: &[CommRecord],
    ) -> io::Result<()> {
        for load in loads {
            write!(
                self.out,
                "{phase},{},{},{}",
                load.entity_id,
                load.whole_phase_load,
                load.subphases.len()
            )?;
            for sub in &load.subphases {
                write!(self.out, ",{sub}")?;
            }
            writeln!(self.out)?;
        }
        for comm in comms {
            writeln!(
                self.out,
                "{phase},{},{},{},{}",
                comm.to_id, comm.from_id, comm.bytes, comm.category as u8
            )?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn file_stats_writes_expected_csv_shape() {
        let dir = std::env::temp_dir().join(format!("amt-stats-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rank0.stats");
        {
            let mut w = FileStats::create(&path).unwrap();
            w.write_phase(
                0,
                &[LoadRecord {
                    entity_id: 7,
                    whole_phase_load: 12.5,
                    subphases: vec![4.0, 8.5],
                }],
                &[CommRecord {
                    to_id: 7,
                    from_id: 3,
                    bytes: 64,
                    category: CommCategory::SendRecv,
                }],
            )
            .unwrap();
            w.flush().unwrap();
        }
        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("0,7,12.5,2,4,8.5"));
        assert_eq!(lines.next(), Some("0,7,3,64,1"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn null_stats_discards_everything() {
        let mut n = NullStats;
        assert!(n.write_phase(0, &[], &[]).is_ok());
        assert!(n.flush().is_ok());
    }
}
