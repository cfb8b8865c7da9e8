//! Source map (revision 3) decoding and position lookup.
//!
//! Only what resymbolization needs: the `sources` list and the `mappings`
//! string, decoded into per-line segments. Names are ignored; the symbol
//! map already supplies member names.

use serde::Deserialize;
use tracing::warn;

use crate::frame::base_name;

#[derive(Debug, thiserror::Error)]
pub enum SourceMapError {
    #[error("unreadable source map: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported source map version {0}")]
    UnsupportedVersion(u32),

    #[error("bad mappings data: {0}")]
    Mappings(String),
}

#[derive(Deserialize)]
struct SourceMapJson {
    version: u32,
    #[serde(default)]
    sources: Vec<String>,
    mappings: String,
}

/// A position in original source, 1-based like the coordinates in a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// One decoded mapping segment. Columns and lines are 0-based here; the
/// public API converts.
#[derive(Debug, Clone, Copy)]
struct Segment {
    generated_column: u32,
    source: usize,
    source_line: u32,
    source_column: u32,
}

/// A decoded source map for one code fragment.
#[derive(Debug)]
pub struct SourceMap {
    sources: Vec<String>,
    /// Segments per generated line, ordered by generated column.
    lines: Vec<Vec<Segment>>,
}

impl SourceMap {
    pub fn parse(json: &str) -> Result<Self, SourceMapError> {
        let raw: SourceMapJson = serde_json::from_str(json)?;
        if raw.version != 3 {
            return Err(SourceMapError::UnsupportedVersion(raw.version));
        }
        let mut lines = Vec::new();
        let mut source = 0i64;
        let mut source_line = 0i64;
        let mut source_column = 0i64;
        for group in raw.mappings.split(';') {
            let mut segments = Vec::new();
            let mut generated_column = 0i64;
            for encoded in group.split(',').filter(|s| !s.is_empty()) {
                let fields = decode_vlq(encoded)?;
                match fields.len() {
                    1 | 4 | 5 => {}
                    n => {
                        return Err(SourceMapError::Mappings(format!(
                            "segment with {n} fields"
                        )))
                    }
                }
                generated_column += fields[0];
                if fields.len() < 4 {
                    // Generated code with no original position.
                    continue;
                }
                source += fields[1];
                source_line += fields[2];
                source_column += fields[3];
                if generated_column < 0 || source < 0 || source_line < 0 || source_column < 0 {
                    return Err(SourceMapError::Mappings("negative position".to_owned()));
                }
                segments.push(Segment {
                    generated_column: generated_column as u32,
                    source: source as usize,
                    source_line: source_line as u32,
                    source_column: source_column as u32,
                });
            }
            lines.push(segments);
        }
        Ok(Self {
            sources: raw.sources,
            lines,
        })
    }

    /// Finds the original position for a 1-based generated line and column:
    /// the last segment on that line whose generated column is not past the
    /// queried one.
    pub fn lookup(&self, line: u32, column: u32) -> Option<OriginalLocation> {
        if line == 0 || column == 0 {
            return None;
        }
        let segments = self.lines.get(line as usize - 1)?;
        let target = column - 1;
        let segment = segments
            .iter()
            .take_while(|segment| segment.generated_column <= target)
            .last()?;
        let file = match self.sources.get(segment.source) {
            Some(source) => base_name(source).to_owned(),
            None => {
                warn!(index = segment.source, "segment references a missing source");
                return None;
            }
        };
        Some(OriginalLocation {
            file,
            line: segment.source_line + 1,
            column: segment.source_column + 1,
        })
    }
}

const VLQ_BASE_SHIFT: u32 = 5;
const VLQ_BASE_MASK: i64 = 0b11111;
const VLQ_CONTINUATION: i64 = 0b100000;

fn base64_value(c: u8) -> Option<i64> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as i64),
        b'a'..=b'z' => Some((c - b'a') as i64 + 26),
        b'0'..=b'9' => Some((c - b'0') as i64 + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Decodes one base64-VLQ segment into its signed fields.
fn decode_vlq(encoded: &str) -> Result<Vec<i64>, SourceMapError> {
    let mut fields = Vec::new();
    let mut value = 0i64;
    let mut shift = 0u32;
    for byte in encoded.bytes() {
        let digit = base64_value(byte).ok_or_else(|| {
            SourceMapError::Mappings(format!("invalid base64 character {:?}", byte as char))
        })?;
        value |= (digit & VLQ_BASE_MASK) << shift;
        if digit & VLQ_CONTINUATION != 0 {
            shift += VLQ_BASE_SHIFT;
            if shift > 62 {
                return Err(SourceMapError::Mappings("vlq overflow".to_owned()));
            }
        } else {
            let negative = value & 1 != 0;
            let magnitude = value >> 1;
            fields.push(if negative { -magnitude } else { magnitude });
            value = 0;
            shift = 0;
        }
    }
    if shift != 0 {
        return Err(SourceMapError::Mappings("truncated vlq segment".to_owned()));
    }
    Ok(fields)
}
