//! Rendering of the final ranking into text lines.

use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use tracing::warn;

use crate::error::FormatError;
use crate::metrics::{Counter, Metrics};
use crate::topk::RankedEntry;

pub const ERROR_TAG: &str = "[Err]:";
pub const REPORT_PREFIX: &str = "Output:";

/// Turns a ranking into output lines, keeping the ranking's order.
pub trait Formatter<K, V> {
    fn format(&self, entries: &[RankedEntry<K, V>], metrics: &dyn Metrics) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// One compact JSON object per line.
    Lines,
    /// A single `Output: [...]` block: every bracket and field on its own
    /// line, no indentation, `": "` between name and value.
    #[default]
    Report,
}

/// Serializes each entry through a row mapping, e.g. to `UserRatings`.
///
/// An entry that fails to serialize is replaced by an `[Err]:` marker and
/// counted; the remaining entries are still rendered.
pub struct JsonFormatter<F> {
    layout: Layout,
    row: F,
}

impl<F> JsonFormatter<F> {
    pub fn new(layout: Layout, row: F) -> Self {
        Self { layout, row }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }
}

impl<K, V, S, F> Formatter<K, V> for JsonFormatter<F>
where
    F: Fn(&RankedEntry<K, V>) -> S,
    S: Serialize,
{
    fn format(&self, entries: &[RankedEntry<K, V>], metrics: &dyn Metrics) -> Vec<String> {
        if entries.is_empty() {
            return Vec::new();
        }
        let rendered: Vec<String> = entries
            .iter()
            .map(|entry| match self.render(&(self.row)(entry)) {
                Ok(json) => json,
                Err(source) => {
                    let err = FormatError { rank: entry.rank, source };
                    warn!(error = %err, "entry could not be serialized");
                    metrics.inc(Counter::FormatErrors, 1);
                    format!("{ERROR_TAG} {err}")
                }
            })
            .collect();

        match self.layout {
            Layout::Lines => rendered,
            Layout::Report => vec![format!("{REPORT_PREFIX} [\n{}\n]", rendered.join(",\n"))],
        }
    }
}

impl<F> JsonFormatter<F> {
    fn render<S: Serialize>(&self, row: &S) -> Result<String, serde_json::Error> {
        match self.layout {
            Layout::Lines => serde_json::to_string(row),
            Layout::Report => {
                let mut out = Vec::new();
                let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b""));
                row.serialize(&mut ser)?;
                String::from_utf8(out).map_err(serde_json::Error::custom)
            }
        }
    }
}
