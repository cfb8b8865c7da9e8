//! # Retrace Compiler
//!
//! Build-time half of the retrace stack-trace emulation system:
//! - a block-structured JavaScript IR with interned names and scopes
//! - a heuristic throwability analyzer over that IR, optionally refined by
//!   Java-side analysis results
//! - the stack-instrumentation pass that rewrites every function to maintain
//!   an emulated call stack (and, optionally, per-frame source locations)
//! - filename obfuscation keyed by occurrence frequency
//! - a small tree-walking interpreter used to run instrumented programs and
//!   collect raw traces from the emulated stack
//!
//! The server-side half that turns raw traces back into Java coordinates
//! lives in the `retrace-resymbolizer` crate.

#![warn(clippy::all)]

pub mod analyzer;
pub mod instrument;
pub mod java;
pub mod js;
pub mod obfuscate;
pub mod runtime;

// Re-export commonly used types
pub use analyzer::{FunctionAnalysis, ThrowabilityAnalyzer};
pub use instrument::{EmulatorOptions, FilenameTableArtifact, StackEmulator, StackMode};
pub use java::JavaHints;
pub use js::ast::{
    BinaryOp, ExprId, JsBlock, JsExpr, JsExprKind, JsFunction, JsLiteral, JsProgram, JsStmt,
    NameId, NodePool, ScopeId, SourceLocation, UnaryOp,
};
pub use obfuscate::{FileNameObfuscator, FrequencyEncoder};
pub use runtime::{collect_trace, EmulatedStackSnapshot, Interpreter, RawTraceFrame, Thrown, Value};

/// Compiler version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for compiler components
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("retrace_compiler=info".parse().unwrap()),
        )
        .init();
}

/// Error types for the instrumentation pass. All of these abort the build:
/// the pass must never silently produce incorrect instrumentation.
#[derive(thiserror::Error, Debug)]
pub enum CompilerError {
    /// A required configuration property was absent. This reflects a
    /// misconfigured build rather than a data problem.
    #[error("missing required property: {0}")]
    MissingProperty(String),

    /// A configuration property had an unusable value.
    #[error("invalid value for {property}: {value:?}")]
    InvalidProperty { property: String, value: String },

    /// An IR shape the pass cannot recognize in a position requiring
    /// rewriting, or a violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompilerError>;
