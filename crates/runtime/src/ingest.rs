//! Ratings ingestion from headered, comma-separated text.
//!
//! Columns are located by name (`userId`, `movieId`, `rating`, `timestamp`)
//! so column order does not matter and extra columns are ignored. Rows that
//! do not parse (bad UTF-8 included) are logged, counted as `malformed_rows`
//! and dropped; they never reach the pipeline. A read error stops the
//! iterator and is reported by [`RatingsReader::finish`].

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{error, warn};

use tally_core::ratings::Rating;
use tally_core::{Counter, Metrics};

const USER_ID: &str = "userId";
const MOVIE_ID: &str = "movieId";
const RATING: &str = "rating";
const TIMESTAMP: &str = "timestamp";

#[derive(Debug, Clone, Copy)]
struct Columns {
    user_id: usize,
    movie_id: usize,
    rating: usize,
    timestamp: usize,
    width: usize,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self> {
        let names: Vec<&str> = header
            .trim_start_matches('\u{feff}')
            .split(',')
            .map(unquote)
            .collect();
        let find = |name: &str| {
            names
                .iter()
                .position(|n| *n == name)
                .ok_or_else(|| anyhow!("header is missing column `{name}`"))
        };
        Ok(Self {
            user_id: find(USER_ID)?,
            movie_id: find(MOVIE_ID)?,
            rating: find(RATING)?,
            timestamp: find(TIMESTAMP)?,
            width: names.len(),
        })
    }

    fn parse(&self, row: &str) -> Result<Rating, String> {
        let fields: Vec<&str> = row.split(',').map(unquote).collect();
        if fields.len() != self.width {
            return Err(format!("expected {} fields, found {}", self.width, fields.len()));
        }
        Ok(Rating {
            user_id: parse_field(&fields, self.user_id, USER_ID)?,
            movie_id: parse_field(&fields, self.movie_id, MOVIE_ID)?,
            rating: parse_field(&fields, self.rating, RATING)?,
            timestamp: parse_field(&fields, self.timestamp, TIMESTAMP)?,
        })
    }
}

fn unquote(field: &str) -> &str {
    let field = field.trim();
    field
        .strip_prefix('"')
        .and_then(|f| f.strip_suffix('"'))
        .unwrap_or(field)
}

fn parse_field<T: std::str::FromStr>(fields: &[&str], index: usize, name: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    fields[index]
        .parse()
        .map_err(|e| format!("column `{name}` value {:?}: {e}", fields[index]))
}

/// Lazily yields the well-formed ratings of a CSV source.
pub struct RatingsReader<B> {
    reader: B,
    buf: Vec<u8>,
    columns: Columns,
    line_no: usize,
    metrics: Arc<dyn Metrics>,
    failure: Option<(usize, io::Error)>,
}

impl<B: BufRead> RatingsReader<B> {
    /// Reads the header eagerly; a missing or incomplete header is an error.
    pub fn new(mut reader: B, metrics: Arc<dyn Metrics>) -> Result<Self> {
        let mut buf = Vec::new();
        if reader.read_until(b'\n', &mut buf).context("reading header row")? == 0 {
            return Err(anyhow!("input is empty, expected a header row"));
        }
        let header = std::str::from_utf8(&buf).context("header row is not valid UTF-8")?;
        let columns = Columns::from_header(trim_newline(header))?;
        Ok(Self { reader, buf, columns, line_no: 1, metrics, failure: None })
    }

    /// Ends ingestion: fails if reading stopped on an I/O error rather than
    /// at end of input.
    pub fn finish(self) -> Result<()> {
        match self.failure {
            None => Ok(()),
            Some((line, err)) => Err(anyhow::Error::new(err).context(format!("reading line {line}"))),
        }
    }
}

impl<B: BufRead> Iterator for RatingsReader<B> {
    type Item = Rating;

    fn next(&mut self) -> Option<Rating> {
        if self.failure.is_some() {
            return None;
        }
        loop {
            self.buf.clear();
            self.line_no += 1;
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => {
                    error!(line = self.line_no, error = %err, "read failed, stopping ingestion");
                    self.failure = Some((self.line_no, err));
                    return None;
                }
            }
            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => trim_newline(line),
                Err(err) => {
                    warn!(line = self.line_no, error = %err, "skipping row that is not valid UTF-8");
                    self.metrics.inc(Counter::MalformedRows, 1);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match self.columns.parse(line) {
                Ok(rating) => return Some(rating),
                Err(reason) => {
                    warn!(line = self.line_no, %reason, "skipping malformed row");
                    self.metrics.inc(Counter::MalformedRows, 1);
                }
            }
        }
    }
}

fn trim_newline(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

pub fn read_ratings(path: &Path, metrics: Arc<dyn Metrics>) -> Result<RatingsReader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    RatingsReader::new(BufReader::new(file), metrics).with_context(|| format!("reading {}", path.display()))
}
