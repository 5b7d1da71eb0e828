//! Machine-readable continuity record embedded in each projected document.
//!
//! ```text
//! <!-- continuity-record v1 -->
//! SESSION_ID = "s1"
//! PHASE = "Phase 2.1"
//! <!-- /continuity-record -->
//! ```
//!
//! Each line carries one canonical element; values are JSON string literals
//! so that multi-line content stays on a single line. A record only counts
//! inside the document's managed block.

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::DateTime;

use crate::state::ElementType;

/// Current record format version.
pub const RECORD_VERSION: u32 = 1;

pub(crate) const BLOCK_BEGIN: &str = "<!-- continuity:begin -->";
pub(crate) const BLOCK_END: &str = "<!-- continuity:end -->";

const RECORD_OPEN_PREFIX: &str = "<!-- continuity-record v";
const RECORD_CLOSE: &str = "<!-- /continuity-record -->";

/// Location of the managed block in a document, markers included.
pub(crate) struct ManagedBlock {
    pub(crate) range: Range<usize>,
    /// False when the end marker is missing; the range then runs to the end.
    pub(crate) closed: bool,
}

/// Find the managed block: the first begin marker and the first end marker
/// after it.
pub(crate) fn find_managed_block(content: &str) -> Option<ManagedBlock> {
    let start = content.find(BLOCK_BEGIN)?;
    let body = start + BLOCK_BEGIN.len();
    Some(match content[body..].find(BLOCK_END) {
        Some(offset) => ManagedBlock {
            range: start..body + offset + BLOCK_END.len(),
            closed: true,
        },
        None => ManagedBlock {
            range: start..content.len(),
            closed: false,
        },
    })
}

/// Render `elements` as a record block. Elements appear in canonical order.
pub fn render_record(elements: &BTreeMap<ElementType, String>) -> String {
    let mut out = format!("{}{} -->\n", RECORD_OPEN_PREFIX, RECORD_VERSION);
    out.push_str("```text\n");
    for (element, value) in elements {
        // Serializing a &str cannot fail.
        let encoded = serde_json::to_string(value).unwrap_or_default();
        out.push_str(&format!("{} = {}\n", element, encoded));
    }
    out.push_str("```\n");
    out.push_str(RECORD_CLOSE);
    out.push('\n');
    out
}

/// Ordering key of a record: its timestamp in microseconds. A record without
/// a readable timestamp sorts first.
pub(crate) fn record_write_order(elements: &BTreeMap<ElementType, String>) -> i64 {
    elements
        .get(&ElementType::Timestamp)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.timestamp_micros())
        .unwrap_or(i64::MIN)
}

/// Parse the record inside the managed block of a document.
///
/// Returns `Ok(None)` if the document has no managed block or the block holds
/// no record, and `Err` with a reason if either is present but unusable.
/// Records outside the block are ignored.
pub fn parse_record(content: &str) -> Result<Option<BTreeMap<ElementType, String>>, String> {
    let Some(block) = find_managed_block(content) else {
        return Ok(None);
    };
    if !block.closed {
        return Err("managed block is not closed".to_string());
    }
    parse_record_text(&content[block.range])
}

fn parse_record_text(content: &str) -> Result<Option<BTreeMap<ElementType, String>>, String> {
    let Some(open) = content.find(RECORD_OPEN_PREFIX) else {
        return Ok(None);
    };
    let after_prefix = &content[open + RECORD_OPEN_PREFIX.len()..];

    let header_end = after_prefix
        .find("-->")
        .ok_or_else(|| "unterminated record header".to_string())?;
    let version: u32 = after_prefix[..header_end]
        .trim()
        .parse()
        .map_err(|_| "unreadable record version".to_string())?;
    if version != RECORD_VERSION {
        return Err(format!("unsupported record version {}", version));
    }

    let body_start = header_end + "-->".len();
    let body_len = after_prefix[body_start..]
        .find(RECORD_CLOSE)
        .ok_or_else(|| "record is not closed".to_string())?;
    let body = &after_prefix[body_start..body_start + body_len];

    let mut elements = BTreeMap::new();
    for line in body.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("```") {
            continue;
        }
        let (name, encoded) = line
            .split_once(" = ")
            .ok_or_else(|| format!("malformed record line: {}", line))?;
        let element: ElementType = name.parse()?;
        let value: String = serde_json::from_str(encoded)
            .map_err(|e| format!("bad value for {}: {}", element, e))?;
        elements.insert(element, value);
    }

    Ok(Some(elements))
}
