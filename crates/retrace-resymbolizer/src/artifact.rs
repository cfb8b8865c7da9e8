//! Access to the per-permutation deploy artifacts.
//!
//! The compiler writes three kinds of artifact per permutation, under
//! well-known names:
//!
//! - `{permutation}.symbolMap` — obfuscated symbol to Java member
//! - `{permutation}.obfuscatedFilenames` — filename code table
//! - `{permutation}_sourceMap{fragment}.json` — per-fragment source map
//!
//! Deployments differ in where these live, so the engine reads them through
//! the [`ArtifactStore`] trait; [`DirectoryStore`] covers the common case of
//! a deploy directory on local disk.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

/// Opens deploy artifacts by name. Implementations must be shareable across
/// threads; the engine calls `open` concurrently.
pub trait ArtifactStore: Send + Sync {
    fn open(&self, file_name: &str) -> io::Result<Box<dyn Read>>;
}

/// Reads artifacts from a directory on disk.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for DirectoryStore {
    fn open(&self, file_name: &str) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(File::open(self.root.join(file_name))?))
    }
}

pub(crate) fn symbol_map_name(permutation: &str) -> String {
    format!("{permutation}.symbolMap")
}

pub(crate) fn filename_table_name(permutation: &str) -> String {
    format!("{permutation}.obfuscatedFilenames")
}

pub(crate) fn source_map_name(permutation: &str, fragment: u32) -> String {
    format!("{permutation}_sourceMap{fragment}.json")
}
