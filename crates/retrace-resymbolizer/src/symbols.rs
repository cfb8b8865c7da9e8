//! Symbol map parsing and the per-permutation symbol table.
//!
//! A symbol map is a line-oriented text artifact. `#` lines are comments;
//! every other line has six comma-separated fields:
//!
//! ```text
//! symbol,Class.member(...),class.binary.Name,fileOrUnknown,line,fragment
//! ```
//!
//! Lines that do not fit are logged and skipped; one bad line never poisons
//! the rest of the map.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use regex::Regex;
use tracing::warn;

use crate::artifact::ArtifactStore;
use crate::frame::base_name;

/// One resolved symbol-map entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Binary name of the declaring class.
    pub class_name: String,
    /// Member name within the class.
    pub member: String,
    /// Declaring source file base name; `None` when the map said `Unknown`.
    pub file_name: Option<String>,
    /// Declaration line of the member.
    pub line: u32,
    /// Code fragment the symbol was emitted into.
    pub fragment: u32,
}

fn member_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(.+)\.([^.()]+)\(.*\)$").unwrap())
}

/// Parses one symbol map line into `(symbol, entry)`. Returns `None` for
/// comments, blank lines and anything malformed; malformed lines warn.
pub fn parse_symbol_line(line: &str) -> Option<(String, SymbolEntry)> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != 6 {
        warn!(line, "skipping malformed symbol map line");
        return None;
    }
    let symbol = parts[0].to_owned();
    let (class_name, member) = match member_ref_pattern().captures(parts[1]) {
        Some(caps) => (caps[1].to_owned(), caps[2].to_owned()),
        // The member reference is unreadable; the binary class name and the
        // symbol itself still identify the frame.
        None => (parts[2].to_owned(), symbol.clone()),
    };
    let file_name = match parts[3] {
        "Unknown" => None,
        path => Some(base_name(path).to_owned()),
    };
    let Ok(line_number) = parts[4].parse::<u32>() else {
        warn!(line, "skipping symbol map line with unreadable line number");
        return None;
    };
    let Ok(fragment) = parts[5].parse::<u32>() else {
        warn!(line, "skipping symbol map line with unreadable fragment id");
        return None;
    };
    Some((
        symbol,
        SymbolEntry {
            class_name,
            member,
            file_name,
            line: line_number,
            fragment,
        },
    ))
}

/// The cached symbols of one permutation. A `None` value is a negative
/// entry: the symbol was looked for and is not in the map, so later frames
/// skip the scan.
#[derive(Default)]
pub(crate) struct SymbolTable {
    entries: RwLock<HashMap<String, Option<Arc<SymbolEntry>>>>,
    fully_loaded: AtomicBool,
}

impl SymbolTable {
    pub(crate) fn lookup(&self, symbol: &str) -> Option<Arc<SymbolEntry>> {
        self.entries.read().get(symbol).cloned().flatten()
    }

    /// Makes sure every symbol in `required` has an entry (positive or
    /// negative). Lazy mode scans the map until the required symbols are
    /// found and retains only those; eager mode reads the whole map once
    /// and keeps everything.
    pub(crate) fn ensure(
        &self,
        store: &dyn ArtifactStore,
        map_name: &str,
        required: &HashSet<String>,
        lazy: bool,
    ) {
        if self.fully_loaded.load(Ordering::Acquire) {
            return;
        }
        let mut missing: HashSet<String> = {
            let entries = self.entries.read();
            required
                .iter()
                .filter(|symbol| !entries.contains_key(*symbol))
                .cloned()
                .collect()
        };
        if lazy && missing.is_empty() {
            return;
        }

        let reader = match store.open(map_name) {
            Ok(reader) => reader,
            Err(error) => {
                warn!(map_name, %error, "symbol map unavailable");
                let mut entries = self.entries.write();
                for symbol in missing {
                    entries.entry(symbol).or_insert(None);
                }
                return;
            }
        };

        let mut found: Vec<(String, SymbolEntry)> = Vec::new();
        for line in BufReader::new(reader).lines() {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    warn!(map_name, %error, "stopped reading symbol map");
                    break;
                }
            };
            let Some((symbol, entry)) = parse_symbol_line(&line) else {
                continue;
            };
            if lazy {
                if missing.remove(&symbol) {
                    found.push((symbol, entry));
                    if missing.is_empty() {
                        break;
                    }
                }
            } else {
                found.push((symbol, entry));
            }
        }

        let mut entries = self.entries.write();
        for (symbol, entry) in found {
            entries.insert(symbol, Some(Arc::new(entry)));
        }
        for symbol in missing {
            entries.entry(symbol).or_insert(None);
        }
        drop(entries);
        if !lazy {
            self.fully_loaded.store(true, Ordering::Release);
        }
    }
}
