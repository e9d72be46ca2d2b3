//! Shared input source for the load generator.
//!
//! The data file is line-oriented. In query mode every non-empty,
//! non-comment line is one record (`NAME TYPE`). In update mode a record is a
//! group of lines terminated by a blank line (or end of file). The file is
//! replayed up to a configurable number of passes; all worker threads pull
//! records from the same reader.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use parking_lot::Mutex;

/// Errors surfaced by [`Datafile::next`].
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The configured number of passes through the input is complete.
    #[error("end of input data")]
    EndOfData,
    /// A full pass over the input produced no records at all.
    #[error("input file contains no data")]
    InvalidFile,
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum Source {
    File(BufReader<File>),
    Stdin(BufReader<io::Stdin>),
}

impl Source {
    fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
        match self {
            Source::File(r) => r.read_line(buf),
            Source::Stdin(r) => r.read_line(buf),
        }
    }

    /// Rewinds to the start of the input. Stdin cannot be replayed.
    fn rewind(&mut self) -> Option<io::Result<()>> {
        match self {
            Source::File(r) => Some(r.seek(SeekFrom::Start(0)).map(|_| ())),
            Source::Stdin(_) => None,
        }
    }
}

struct Inner {
    source: Source,
    /// Completed passes over the input.
    runs: u32,
    /// Records produced during the current pass.
    records_this_run: u64,
}

/// Thread-safe record provider with a bounded replay count.
pub struct Datafile {
    inner: Mutex<Inner>,
    /// Maximum number of passes; `0` means unlimited.
    max_runs: u32,
}

impl Datafile {
    /// Opens the given path, or stdin when `path` is `None` or `-`.
    pub fn open(path: Option<&Path>) -> io::Result<Self> {
        let source = match path {
            Some(p) if p.as_os_str() != "-" => Source::File(BufReader::new(File::open(p)?)),
            _ => Source::Stdin(BufReader::new(io::stdin())),
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                source,
                runs: 0,
                records_this_run: 0,
            }),
            max_runs: 0,
        })
    }

    /// Bounds the number of passes over the input. `0` leaves it unlimited.
    pub fn set_max_runs(&mut self, max_runs: u32) {
        self.max_runs = max_runs;
    }

    /// Completed passes so far.
    pub fn runs_completed(&self) -> u32 {
        self.inner.lock().runs
    }

    /// Returns the next record.
    ///
    /// Query records are single lines; update records are the lines of one
    /// group joined with `\n`.
    pub fn next(&self, updates: bool) -> Result<String, ReadError> {
        let mut inner = self.inner.lock();

        if updates {
            self.next_update(&mut inner)
        } else {
            self.next_query(&mut inner)
        }
    }

    fn next_query(&self, inner: &mut Inner) -> Result<String, ReadError> {
        let mut line = String::new();
        loop {
            line.clear();
            if inner.source.read_line(&mut line)? == 0 {
                self.wrap(inner)?;
                continue;
            }
            let record = line.trim();
            if record.is_empty() || record.starts_with(';') || record.starts_with('#') {
                continue;
            }
            inner.records_this_run += 1;
            return Ok(record.to_string());
        }
    }

    fn next_update(&self, inner: &mut Inner) -> Result<String, ReadError> {
        let mut group = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = inner.source.read_line(&mut line)?;
            if n == 0 {
                if group.is_empty() {
                    self.wrap(inner)?;
                    continue;
                }
                break;
            }
            let record = line.trim_end();
            if record.starts_with(';') || record.starts_with('#') {
                continue;
            }
            if record.trim().is_empty() {
                if group.is_empty() {
                    continue;
                }
                break;
            }
            if !group.is_empty() {
                group.push('\n');
            }
            group.push_str(record);
        }
        inner.records_this_run += 1;
        Ok(group)
    }

    /// Handles end of input: either starts the next pass or reports that the
    /// data is exhausted.
    fn wrap(&self, inner: &mut Inner) -> Result<(), ReadError> {
        if inner.runs == 0 && inner.records_this_run == 0 {
            return Err(ReadError::InvalidFile);
        }
        if inner.records_this_run > 0 {
            inner.runs += 1;
            inner.records_this_run = 0;
        }
        if self.max_runs != 0 && inner.runs >= self.max_runs {
            return Err(ReadError::EndOfData);
        }
        match inner.source.rewind() {
            Some(result) => result?,
            None => {
                tracing::debug!("Input is not seekable; treating end of stream as end of data");
                return Err(ReadError::EndOfData);
            }
        }
        Ok(())
    }
}
