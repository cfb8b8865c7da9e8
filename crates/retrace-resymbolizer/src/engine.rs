//! The resymbolization engine.
//!
//! Per frame, resolution layers four sources of truth, each one optional:
//!
//! 1. the encoded location: an explicit line, and either a plain filename
//!    or an obfuscated filename code resolved through the filename table
//! 2. the symbol map entry for the frame's symbol: declaring class and
//!    member, plus declaration file and line as fallbacks only
//! 3. the fragment id, from the symbol map, the generated script name, or
//!    the permutation name itself
//! 4. for column-bearing frames, the fragment's source map, whose answer
//!    overrides file and line
//!
//! No step can fail the frame; missing artifacts degrade with a warning.

use std::collections::HashSet;
use std::io::Read;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::artifact::{filename_table_name, source_map_name, symbol_map_name, ArtifactStore};
use crate::cache::ArtifactCache;
use crate::frame::{EncodedLocation, RawFrame, ResolvedFrame, UNKNOWN_CLASS};
use crate::source_map::SourceMap;
use crate::symbols::SymbolTable;

fn filename_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+$").unwrap())
}

fn fragment_script_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)\.js$").unwrap())
}

/// Resymbolizes raw traces against one artifact store. Cheap to share:
/// all caches take shared references and internal locks.
pub struct Resymbolizer<S: ArtifactStore> {
    store: S,
    lazy_load: bool,
    symbols: DashMap<String, Arc<SymbolTable>>,
    filename_tables: ArtifactCache<Vec<String>>,
    source_maps: ArtifactCache<SourceMap>,
}

impl<S: ArtifactStore> Resymbolizer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            lazy_load: false,
            symbols: DashMap::new(),
            filename_tables: ArtifactCache::default(),
            source_maps: ArtifactCache::default(),
        }
    }

    /// In lazy mode the symbol map is scanned per request and only the
    /// requested symbols are retained. Useful when maps are large and
    /// traffic is light; resolution results are identical either way.
    pub fn with_lazy_load(mut self, lazy_load: bool) -> Self {
        self.lazy_load = lazy_load;
        self
    }

    /// Resymbolizes a whole trace. The result has the same length and
    /// order as the input and this never fails; see the module docs for
    /// how individual frames degrade.
    pub fn resymbolize(&self, frames: &[RawFrame], permutation: &str) -> Vec<ResolvedFrame> {
        let required: HashSet<String> = frames.iter().map(|f| f.symbol.clone()).collect();
        let table = self.symbol_table(permutation);
        table.ensure(
            &self.store,
            &symbol_map_name(permutation),
            &required,
            self.lazy_load,
        );
        frames
            .iter()
            .map(|frame| self.resolve(frame, permutation, &table))
            .collect()
    }

    /// Resymbolizes a single frame.
    pub fn resymbolize_frame(&self, frame: &RawFrame, permutation: &str) -> ResolvedFrame {
        let required: HashSet<String> = [frame.symbol.clone()].into();
        let table = self.symbol_table(permutation);
        table.ensure(
            &self.store,
            &symbol_map_name(permutation),
            &required,
            self.lazy_load,
        );
        self.resolve(frame, permutation, &table)
    }

    fn resolve(
        &self,
        raw: &RawFrame,
        permutation: &str,
        table: &SymbolTable,
    ) -> ResolvedFrame {
        let loc = raw
            .encoded_location
            .as_deref()
            .map(EncodedLocation::parse)
            .unwrap_or_default();

        let mut file_name: Option<String> = None;
        let mut line = loc.line;

        // A column-bearing frame names a generated script, not a source
        // file; only the source map can turn that into a filename.
        if !loc.source_map_capable() {
            if let Some(raw_file) = &loc.file {
                if filename_code_pattern().is_match(raw_file) {
                    file_name = self.resolve_filename_code(raw_file, permutation);
                } else {
                    file_name = Some(raw_file.clone());
                }
            }
        }

        let entry = table.lookup(&raw.symbol);
        let mut fragment = None;
        let (class_name, member) = match &entry {
            Some(entry) => {
                // The client-recorded location is the throw site; the map
                // only knows the declaration site. Explicit data wins.
                if file_name.is_none() {
                    file_name = entry.file_name.clone();
                }
                if line.is_none() {
                    line = Some(entry.line);
                }
                fragment = Some(entry.fragment);
                (Some(entry.class_name.clone()), Some(entry.member.clone()))
            }
            None => {
                debug!(symbol = %raw.symbol, permutation, "symbol not in map");
                (None, None)
            }
        };

        if fragment.is_none() {
            if let Some(raw_file) = &loc.file {
                fragment = self.infer_fragment(raw_file, permutation);
            }
        }

        if let (true, Some(fragment), Some(js_line), Some(column)) =
            (loc.source_map_capable(), fragment, loc.line, loc.column)
        {
            if let Some(map) = self.source_map(permutation, fragment) {
                if let Some(original) = map.lookup(js_line, column) {
                    file_name = Some(original.file);
                    line = Some(original.line);
                }
            }
        }

        ResolvedFrame {
            class_name: class_name.unwrap_or_else(|| UNKNOWN_CLASS.to_owned()),
            member: member.unwrap_or_else(|| raw.symbol.clone()),
            file_name,
            line,
        }
    }

    fn symbol_table(&self, permutation: &str) -> Arc<SymbolTable> {
        self.symbols
            .entry(permutation.to_owned())
            .or_default()
            .clone()
    }

    fn resolve_filename_code(&self, code: &str, permutation: &str) -> Option<String> {
        let table = self.filename_table(permutation)?;
        let index: usize = code.parse().ok()?;
        match table.get(index) {
            Some(name) => Some(name.clone()),
            None => {
                warn!(code, permutation, "filename code out of table range");
                None
            }
        }
    }

    fn filename_table(&self, permutation: &str) -> Option<Arc<Vec<String>>> {
        self.filename_tables.get_or_load(permutation, || {
            let name = filename_table_name(permutation);
            let mut contents = String::new();
            match self.store.open(&name) {
                Ok(mut reader) => {
                    if let Err(error) = reader.read_to_string(&mut contents) {
                        warn!(%name, %error, "filename table unreadable");
                        return None;
                    }
                }
                Err(error) => {
                    warn!(%name, %error, "filename table unavailable");
                    return None;
                }
            }
            // One comma-separated line, in code order.
            Some(
                contents
                    .trim_end()
                    .split(',')
                    .map(str::to_owned)
                    .collect(),
            )
        })
    }

    /// The generated script name carries the fragment id; the initial
    /// download is named after the permutation and is fragment 0.
    fn infer_fragment(&self, raw_file: &str, permutation: &str) -> Option<u32> {
        if let Some(caps) = fragment_script_pattern().captures(raw_file) {
            if let Ok(fragment) = caps[1].parse() {
                return Some(fragment);
            }
        }
        raw_file.contains(permutation).then_some(0)
    }

    fn source_map(&self, permutation: &str, fragment: u32) -> Option<Arc<SourceMap>> {
        let name = source_map_name(permutation, fragment);
        self.source_maps.get_or_load(&name, || {
            let mut contents = String::new();
            match self.store.open(&name) {
                Ok(mut reader) => {
                    if let Err(error) = reader.read_to_string(&mut contents) {
                        warn!(%name, %error, "source map unreadable");
                        return None;
                    }
                }
                Err(error) => {
                    debug!(%name, %error, "no source map for fragment");
                    return None;
                }
            }
            match SourceMap::parse(&contents) {
                Ok(map) => Some(map),
                Err(error) => {
                    warn!(%name, %error, "source map rejected");
                    None
                }
            }
        })
    }
}
