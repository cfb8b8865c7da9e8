//! Filename obfuscation for recorded source locations.
//!
//! When location recording is on, expressions inlined from a different file
//! than their enclosing function get a `'fileName:lineNumber'` string
//! recorded. Shipping plaintext filenames would be wasteful, so the
//! obfuscation runs in two phases: phase 1 collects every location literal
//! minted during instrumentation; phase 2 replaces each filename with its
//! ordinal code, shortest codes going to the most frequent files, and emits
//! the per-permutation filename table the resymbolizer needs to reverse the
//! mapping.

use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::js::ast::{ExprId, JsExpr, JsExprKind, JsLiteral, JsStmt, NodePool, SourceLocation};
use crate::js::walk;
use crate::{CompilerError, Result};

/// Counts keys and assigns ordinal codes by descending frequency. Ties keep
/// first-encounter order, so code assignment is stable between builds.
#[derive(Debug, Default)]
pub struct FrequencyEncoder<T: Eq + Hash> {
    counts: IndexMap<T, u64>,
}

impl<T: Eq + Hash> FrequencyEncoder<T> {
    pub fn new() -> Self {
        Self {
            counts: IndexMap::new(),
        }
    }

    pub fn record(&mut self, key: T) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Consumes the counter and returns `key -> code`, iterable in code
    /// order (0, 1, 2, ...).
    pub fn assign_codes(self) -> IndexMap<T, usize> {
        let mut entries: Vec<(T, u64)> = self.counts.into_iter().collect();
        // stable sort: equal frequencies stay in first-encounter order
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries
            .into_iter()
            .enumerate()
            .map(|(code, (key, _))| (key, code))
            .collect()
    }
}

/// The per-permutation filename table, published alongside the symbol map.
/// The index of a filename in the table is its obfuscated code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilenameTableArtifact {
    pub permutation_id: u32,
    pub filenames: Vec<String>,
}

impl FilenameTableArtifact {
    /// The single comma-separated line written to the artifact file.
    pub fn table_line(&self) -> String {
        self.filenames.join(",")
    }
}

#[derive(Debug, Default)]
pub struct FileNameObfuscator {
    /// Phase 1 output: id and value of every minted location literal, in
    /// creation order. `None` once phase 2 has locked in the results.
    collected: Option<IndexMap<ExprId, String>>,
    /// Phase 2 output: plain filename -> ordinal code, in code order.
    codes: Option<IndexMap<String, String>>,
}

impl FileNameObfuscator {
    pub fn new() -> Self {
        Self {
            collected: Some(IndexMap::new()),
            codes: None,
        }
    }

    /// Phase 1: mints a `'fileName:lineNumber'` literal and remembers it for
    /// later rewriting.
    pub fn location_literal(
        &mut self,
        pool: &NodePool,
        loc: SourceLocation,
        file: &str,
        line: u32,
    ) -> JsExpr {
        let value = format!("{file}:{line}");
        let expr = pool.str(loc, value.clone());
        self.collected
            .as_mut()
            .expect("location literal minted after obfuscation")
            .insert(expr.id, value);
        expr
    }

    /// Phase 2: assigns codes and rewrites every collected literal in the
    /// program from `'fileName:line'` to `'code:line'`. May run only once.
    pub fn obfuscate(&mut self, global_block: &mut [JsStmt]) -> Result<()> {
        let collected = self.collected.take().ok_or_else(|| {
            CompilerError::Internal("filename obfuscation already performed".into())
        })?;

        // The compiler hoists duplicate string literals into shared globals,
        // so frequency is counted over distinct location values only.
        let unique: IndexSet<&String> = collected.values().collect();
        let mut encoder = FrequencyEncoder::new();
        for location in &unique {
            let (file, _) = split_location(location);
            encoder.record(file.to_owned());
        }
        let codes: IndexMap<String, String> = encoder
            .assign_codes()
            .into_iter()
            .map(|(file, code)| (file, code.to_string()))
            .collect();
        debug!(files = codes.len(), literals = collected.len(), "obfuscated filenames");

        let mut rewriter = Rewriter {
            collected: &collected,
            codes: &codes,
        };
        walk::visit_stmts(&mut rewriter, global_block);
        self.codes = Some(codes);
        Ok(())
    }

    /// The deobfuscation table, available once phase 2 has run. `None` when
    /// no filenames were obfuscated: there is nothing to reverse.
    pub fn make_artifact(&self, permutation_id: u32) -> Option<FilenameTableArtifact> {
        let codes = self.codes.as_ref()?;
        if codes.is_empty() {
            return None;
        }
        Some(FilenameTableArtifact {
            permutation_id,
            filenames: codes.keys().cloned().collect(),
        })
    }
}

fn split_location(value: &str) -> (&str, &str) {
    match value.find(':') {
        Some(idx) => (&value[..idx], &value[idx + 1..]),
        None => (value, ""),
    }
}

struct Rewriter<'a> {
    collected: &'a IndexMap<ExprId, String>,
    codes: &'a IndexMap<String, String>,
}

impl walk::MutVisitor for Rewriter<'_> {
    fn exit_expr(&mut self, expr: &mut JsExpr) {
        if let JsExprKind::Literal(JsLiteral::Str(value)) = &mut expr.kind {
            if self.collected.contains_key(&expr.id) {
                let (file, line) = split_location(value);
                // every collected filename has a code by construction
                let code = &self.codes[file];
                *value = format!("{code}:{line}");
            }
        }
    }
}
