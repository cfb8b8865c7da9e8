//! Reading a raw trace back out of the emulated stack.

use serde::{Deserialize, Serialize};

use super::{Interpreter, Value};
use crate::js::ast::NodePool;

/// The four emulation globals, captured after (or during) execution.
#[derive(Debug, Clone)]
pub struct EmulatedStackSnapshot {
    pub stack: Vec<Value>,
    pub location: Vec<Value>,
    pub depth: i64,
    pub cap: Option<i64>,
}

impl EmulatedStackSnapshot {
    pub fn capture(interp: &Interpreter) -> Self {
        let array = |ident: &str| match interp.global_by_ident(ident) {
            Some(Value::Array(items)) => items.borrow().clone(),
            _ => Vec::new(),
        };
        Self {
            stack: array("$stack"),
            location: array("$location"),
            depth: match interp.global_by_ident("$stackDepth") {
                Some(Value::Num(n)) => n as i64,
                _ => -1,
            },
            cap: match interp.global_by_ident("$stackDepthCap") {
                Some(Value::Num(n)) => Some(n as i64),
                _ => None,
            },
        }
    }
}

/// One frame of a raw (still obfuscated) trace, as a client would ship it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTraceFrame {
    /// The obfuscated function identifier, `"anonymous"` for null frames.
    pub symbol: String,
    /// `"line"`, `"file:line"` or `"code:line"`, when recorded.
    pub encoded_location: Option<String>,
}

/// Turns a snapshot into frames, innermost first. A set depth cap wins over
/// the live depth, so a trace captured during exception construction ends at
/// the frame doing the construction.
pub fn collect_trace(snapshot: &EmulatedStackSnapshot, pool: &NodePool) -> Vec<RawTraceFrame> {
    let depth = snapshot.cap.unwrap_or(snapshot.depth);
    let mut frames = Vec::new();
    let mut i = depth;
    while i >= 0 {
        let idx = i as usize;
        let symbol = match snapshot.stack.get(idx) {
            Some(Value::Function(closure)) => closure.name().map(|name| pool.ident(name)),
            _ => None,
        };
        let encoded_location = match snapshot.location.get(idx) {
            Some(Value::Str(s)) => Some(s.clone()),
            Some(Value::Num(n)) => Some(format_line(*n)),
            _ => None,
        };
        frames.push(RawTraceFrame {
            symbol: symbol.unwrap_or_else(|| "anonymous".to_owned()),
            encoded_location,
        });
        i -= 1;
    }
    frames
}

/// Collapses repeated frames at the outer end of a trace, an artifact of
/// deeply inlined recursion. Heuristic; callers opt in, it is never applied
/// implicitly.
pub fn dedup_trailing_recursion(frames: &mut Vec<RawTraceFrame>) {
    while frames.len() >= 2 && frames[frames.len() - 1] == frames[frames.len() - 2] {
        frames.pop();
    }
}

fn format_line(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}
