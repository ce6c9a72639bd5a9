//! Newline-delimited text output.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

/// Writes each item on its own line, creating missing parent directories.
/// Returns the number of lines written.
pub fn write_lines<I, S>(path: &Path, lines: I) -> Result<usize>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let mut written = 0usize;
    for line in lines {
        writeln!(out, "{}", line.as_ref()).with_context(|| format!("writing {}", path.display()))?;
        written += 1;
    }
    out.flush().with_context(|| format!("flushing {}", path.display()))?;
    info!(path = %path.display(), lines = written, "output written");
    Ok(written)
}
