//! Beacon-log parser: turns ldapsearch-BOF/pyldapsearch style output into
//! raw attribute records for the engine. Records are blocks of
//! `attribute: value` lines separated by a dashed delimiter line; beacon
//! framing (`received output:` prefixes) is stripped. Attribute names are
//! lower-cased and repeated attributes are pre-joined with `", "`.
//!
//! Large logs are read through a memory map above a size threshold,
//! buffered line reads below it.
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use memmap2::Mmap;
use rayon::prelude::*;

use crate::object::AttributeRecord;

/// File size at which parsing switches to a memory-mapped read.
pub const MMAP_THRESHOLD_BYTES: u64 = 16 * 1024 * 1024;

const RECORD_DELIMITER_LEN: usize = 20;
const OUTPUT_MARKER: &str = "received output:";

enum LineSource {
    Buffered(Lines<BufReader<File>>),
    Mapped { map: Mmap, pos: usize },
}

impl Iterator for LineSource {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            LineSource::Buffered(lines) => lines.next(),
            LineSource::Mapped { map, pos } => {
                let data: &[u8] = map;
                if *pos >= data.len() {
                    return None;
                }
                let start = *pos;
                let end = match memchr::memchr(b'\n', &data[start..]) {
                    Some(offset) => start + offset,
                    None => data.len(),
                };
                *pos = end + 1;
                let mut slice = &data[start..end];
                if slice.ends_with(b"\r") {
                    slice = &slice[..slice.len() - 1];
                }
                Some(Ok(String::from_utf8_lossy(slice).into_owned()))
            }
        }
    }
}

fn open_lines(path: &Path, mmap_threshold: u64) -> Result<LineSource> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if size >= mmap_threshold {
        let map =
            unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {}", path.display()))?;
        Ok(LineSource::Mapped { map, pos: 0 })
    } else {
        Ok(LineSource::Buffered(BufReader::new(file).lines()))
    }
}

/// Accumulates attribute lines into records and flushes them at each
/// delimiter.
#[derive(Default)]
struct RecordAccumulator {
    current: AttributeRecord,
    records: Vec<AttributeRecord>,
}

impl RecordAccumulator {
    fn feed(&mut self, line: &str) {
        // Strip beacon framing; the payload follows the marker.
        let line = match line.find(OUTPUT_MARKER) {
            Some(idx) => &line[idx + OUTPUT_MARKER.len()..],
            None => line,
        };
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if line.len() >= RECORD_DELIMITER_LEN && line.bytes().all(|b| b == b'-') {
            self.flush();
            return;
        }
        let Some((name, value)) = line.split_once(": ") else {
            return;
        };
        let name = name.trim().to_lowercase();
        let value = value.trim();
        if name.is_empty() || value.is_empty() {
            return;
        }
        self.current
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.records.push(std::mem::take(&mut self.current));
        }
    }

    fn finish(mut self) -> Vec<AttributeRecord> {
        self.flush();
        self.records
    }
}

/// Parse in-memory log content. Intended for tests and small programmatic
/// integrations.
pub fn parse_contents(content: &str) -> Vec<AttributeRecord> {
    let mut acc = RecordAccumulator::default();
    for line in content.lines() {
        acc.feed(line);
    }
    acc.finish()
}

/// Parse one log file, choosing the read strategy by file size.
pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<AttributeRecord>> {
    parse_file_with_threshold(path, MMAP_THRESHOLD_BYTES)
}

pub fn parse_file_with_threshold<P: AsRef<Path>>(
    path: P,
    mmap_threshold: u64,
) -> Result<Vec<AttributeRecord>> {
    let mut acc = RecordAccumulator::default();
    for line in open_lines(path.as_ref(), mmap_threshold)? {
        let line = line.with_context(|| format!("read {}", path.as_ref().display()))?;
        acc.feed(&line);
    }
    let records = acc.finish();
    debug!(
        "parsed {} records from {}",
        records.len(),
        path.as_ref().display()
    );
    Ok(records)
}

/// Parse a set of log files sequentially, preserving file order so later
/// sightings merge onto earlier ones deterministically.
pub fn parse_files(paths: &[PathBuf]) -> Result<Vec<AttributeRecord>> {
    let mut records = Vec::new();
    for path in paths {
        records.extend(parse_file(path)?);
    }
    Ok(records)
}

/// Parse a set of log files in parallel. Results keep the input file
/// order; only the per-file work is concurrent.
pub fn parse_files_parallel(paths: &[PathBuf]) -> Result<Vec<AttributeRecord>> {
    let per_file: Vec<Vec<AttributeRecord>> = paths
        .par_iter()
        .map(parse_file)
        .collect::<Result<_>>()?;
    Ok(per_file.into_iter().flatten().collect())
}
