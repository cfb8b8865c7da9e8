//! # Retrace Resymbolizer
//!
//! Server-side half of the retrace stack-trace emulation system: turns raw,
//! obfuscated traces captured by instrumented clients back into Java
//! class/method/file/line coordinates, using the artifacts the compiler
//! emits per build permutation (symbol map, obfuscated filename table and
//! optional per-fragment source maps).
//!
//! Resymbolization never fails: every artifact problem is caught per
//! artifact, logged as a warning, and degrades that one frame to the best
//! available data. Worst case a client sees its own raw frame echoed back.

#![warn(clippy::all)]

pub mod artifact;
pub mod engine;
pub mod frame;
pub mod source_map;
pub mod symbols;

mod cache;

pub use artifact::{ArtifactStore, DirectoryStore};
pub use engine::Resymbolizer;
pub use frame::{EncodedLocation, RawFrame, ResolvedFrame, UNKNOWN_CLASS};
pub use source_map::{OriginalLocation, SourceMap};
pub use symbols::SymbolEntry;

/// Resymbolizer version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for resymbolizer components
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("retrace_resymbolizer=info".parse().unwrap()),
        )
        .init();
}
