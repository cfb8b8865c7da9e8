//! Interface to the higher-level (Java) AST, exposed only at the boundary
//! the instrumentation pass needs: "can this language-level expression,
//! identified by its enclosing chain of source locations, ever fail", plus
//! the identities of the support functions the pass must recognize.
//!
//! The front end that lowers Java to the JS IR builds a [`JavaHints`] while
//! it still has the Java AST in hand. Everything here is best effort:
//! missing hints only increase instrumentation density, never break it.

use std::collections::HashMap;

use crate::js::ast::SourceLocation;

/// Stores chains of ancestor source locations arising during an AST
/// traversal, the first element of a chain being the most specific.
///
/// Several lowered expressions frequently share one source location (e.g. a
/// call and the receiver parameter it was rewritten with), so a single
/// location cannot identify an expression across the two ASTs. The chain of
/// enclosing locations disambiguates: the longer the common prefix between a
/// stored chain and a queried one, the more likely the two expressions
/// correspond.
#[derive(Debug, Default)]
pub struct LocationTrie {
    root: ChainNode,
}

#[derive(Debug, Default)]
struct ChainNode {
    children: HashMap<SourceLocation, ChainNode>,
}

impl LocationTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chain: the expression's own location followed by its
    /// ancestors' locations, innermost first, up to the method body level.
    pub fn add<'a>(&mut self, chain: impl IntoIterator<Item = &'a SourceLocation>) {
        let mut node = &mut self.root;
        for loc in chain {
            node = node.children.entry(loc.clone()).or_default();
        }
    }

    /// Length of the longest stored chain sharing a prefix with the given
    /// one, or 0 if not even the first location is present.
    pub fn longest_match<'a>(
        &self,
        chain: impl IntoIterator<Item = &'a SourceLocation>,
    ) -> usize {
        let mut node = &self.root;
        let mut matched = 0;
        for loc in chain {
            match node.children.get(loc) {
                Some(next) => {
                    node = next;
                    matched += 1;
                }
                None => break,
            }
        }
        matched
    }

    /// Number of distinct complete chains stored.
    pub fn len(&self) -> usize {
        fn count(node: &ChainNode) -> usize {
            if node.children.is_empty() {
                return 1;
            }
            node.children.values().map(count).sum()
        }
        if self.root.children.is_empty() {
            0
        } else {
            self.root.children.values().map(count).sum()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }
}

/// Results of Java-side static analysis, keyed by location chains, plus the
/// type facts the pass cannot recover from the JS IR alone.
#[derive(Debug, Default)]
pub struct JavaHints {
    /// Chains of Java expressions the Java analyzer proved able to throw.
    pub can_throw: LocationTrie,
    /// Chains of Java expressions the Java analyzer proved unable to throw.
    pub can_not_throw: LocationTrie,
    /// Long identifiers of functions that are constructors of Throwable
    /// subtypes. Instantiations of these get depth-cap treatment.
    throwable_ctors: std::collections::HashSet<String>,
    /// Long identifiers of functions lowered from Java methods, i.e. those
    /// for which the location-chain refinement is meaningful.
    java_methods: std::collections::HashSet<String>,
}

impl JavaHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_throwable_ctor(&mut self, long_ident: impl Into<String>) {
        self.throwable_ctors.insert(long_ident.into());
    }

    pub fn is_throwable_ctor(&self, long_ident: &str) -> bool {
        self.throwable_ctors.contains(long_ident)
    }

    pub fn add_java_method(&mut self, long_ident: impl Into<String>) {
        self.java_methods.insert(long_ident.into());
    }

    pub fn is_java_method(&self, long_ident: &str) -> bool {
        self.java_methods.contains(long_ident)
    }

    /// Whether the Java expression best matching the given chain was proven
    /// unable to throw. Ties go to "may throw": over-instrumenting is safe,
    /// losing a real frame is not.
    pub fn chain_can_not_throw<'a>(
        &self,
        chain: impl IntoIterator<Item = &'a SourceLocation> + Clone,
    ) -> bool {
        let yes_weight = self.can_throw.longest_match(chain.clone());
        let no_weight = self.can_not_throw.longest_match(chain);
        no_weight > yes_weight
    }
}
