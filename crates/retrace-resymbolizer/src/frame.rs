//! Frame model and encoded-location parsing.
//!
//! A raw frame carries the obfuscated function symbol plus an optional
//! encoded location, in one of the shapes the instrumented client records:
//!
//! - `"42"` — a bare line number, same file as the enclosing function
//! - `"0:42"` — an obfuscated filename code and a line
//! - `"Foo.java:42"` — a plain filename and a line
//! - `"0.js@13:42"` — a generated-script name, a column and a line; the
//!   `@` column marker means the frame can be refined through a source map

use serde::{Deserialize, Serialize};

/// Placeholder class for frames whose declaring class could not be resolved.
pub const UNKNOWN_CLASS: &str = "Unknown";

/// One obfuscated frame as shipped by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    /// The obfuscated function identifier.
    pub symbol: String,
    /// The recorded location, when the client had one.
    pub encoded_location: Option<String>,
}

impl RawFrame {
    pub fn new(symbol: impl Into<String>, encoded_location: Option<&str>) -> Self {
        Self {
            symbol: symbol.into(),
            encoded_location: encoded_location.map(str::to_owned),
        }
    }
}

/// One resymbolized frame. Every field degrades independently: a frame whose
/// symbol is absent from the symbol map still keeps whatever file and line
/// its encoded location carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFrame {
    /// Binary name of the declaring class, or [`UNKNOWN_CLASS`].
    pub class_name: String,
    /// Member name within the class, or the raw symbol when unresolved.
    pub member: String,
    /// Source file base name, when known.
    pub file_name: Option<String>,
    /// Source line, when known.
    pub line: Option<u32>,
}

impl std::fmt::Display for ResolvedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}(", self.class_name, self.member)?;
        match (&self.file_name, self.line) {
            (Some(file), Some(line)) => write!(f, "{file}:{line}")?,
            (Some(file), None) => write!(f, "{file}")?,
            (None, Some(line)) => write!(f, "?:{line}")?,
            (None, None) => write!(f, "Unknown Source")?,
        }
        write!(f, ")")
    }
}

/// The parsed form of an encoded location. Unparsable pieces come back as
/// `None` rather than failing the frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedLocation {
    /// Filename part: a plain name, an obfuscated code, or a script name.
    pub file: Option<String>,
    /// Line within the recorded file.
    pub line: Option<u32>,
    /// Column within the generated script. Present only when the client
    /// recorded through the `@` marker; its presence makes the frame
    /// source-map capable.
    pub column: Option<u32>,
}

impl EncodedLocation {
    pub fn parse(encoded: &str) -> Self {
        let (head, line) = match encoded.rsplit_once(':') {
            Some((head, tail)) => match tail.parse::<u32>() {
                Ok(line) => (head, Some(line)),
                Err(_) => (encoded, None),
            },
            None => match encoded.parse::<u32>() {
                // A bare integer is a line in the enclosing function's file.
                Ok(line) => {
                    return Self {
                        file: None,
                        line: Some(line),
                        column: None,
                    }
                }
                Err(_) => (encoded, None),
            },
        };
        if let Some((file, marker)) = head.rsplit_once('@') {
            if let Ok(column) = marker.parse::<u32>() {
                return Self {
                    file: Some(file.to_owned()),
                    line,
                    column: Some(column),
                };
            }
        }
        Self {
            file: (!head.is_empty()).then(|| head.to_owned()),
            line,
            column: None,
        }
    }

    /// Whether the frame recorded a generated-script column and can be
    /// refined through a source map.
    pub fn source_map_capable(&self) -> bool {
        self.column.is_some()
    }
}

/// Strips any directory prefix, leaving the base file name.
pub(crate) fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn bare_integer_is_a_line_number() {
        assert_eq!(
            EncodedLocation::parse("42"),
            EncodedLocation {
                file: None,
                line: Some(42),
                column: None,
            }
        );
    }

    #[test]
    fn code_and_line_split_at_the_last_colon() {
        assert_eq!(
            EncodedLocation::parse("0:42"),
            EncodedLocation {
                file: Some("0".to_owned()),
                line: Some(42),
                column: None,
            }
        );
        assert_eq!(
            EncodedLocation::parse("Foo.java:42"),
            EncodedLocation {
                file: Some("Foo.java".to_owned()),
                line: Some(42),
                column: None,
            }
        );
    }

    #[test]
    fn column_marker_makes_the_frame_source_map_capable() {
        let loc = EncodedLocation::parse("cache/3.js@13:42");
        assert_eq!(
            loc,
            EncodedLocation {
                file: Some("cache/3.js".to_owned()),
                line: Some(42),
                column: Some(13),
            }
        );
        assert!(loc.source_map_capable());
    }

    #[test]
    fn garbage_degrades_to_a_filename() {
        assert_eq!(
            EncodedLocation::parse("not a location"),
            EncodedLocation {
                file: Some("not a location".to_owned()),
                line: None,
                column: None,
            }
        );
    }

    #[test]
    fn display_covers_every_degradation() {
        let full = ResolvedFrame {
            class_name: "com.example.Widget".to_owned(),
            member: "render".to_owned(),
            file_name: Some("Widget.java".to_owned()),
            line: Some(42),
        };
        assert_eq!(full.to_string(), "com.example.Widget.render(Widget.java:42)");

        let bare = ResolvedFrame {
            class_name: UNKNOWN_CLASS.to_owned(),
            member: "xYz".to_owned(),
            file_name: None,
            line: None,
        };
        assert_eq!(bare.to_string(), "Unknown.xYz(Unknown Source)");
    }

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("com/example/Widget.java"), "Widget.java");
        assert_eq!(base_name("Widget.java"), "Widget.java");
    }
}
