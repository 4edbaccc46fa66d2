//! Lumen Router - Ordered route table
//!
//! Routes are kept in registration order and matched linearly. The first
//! route whose method and segments fit the request wins, so a static route
//! registered after an overlapping parameter route is shadowed by it.
//!
//! # Example
//!
//! ```
//! use lumen_router::Router;
//!
//! let mut router = Router::new();
//! router.insert("GET", "/users", 1).unwrap();
//! router.insert("GET", "/users/:id", 2).unwrap();
//! router.insert("GET", "/static/*", 3).unwrap();
//!
//! let m = router.find("GET", "/users/123").unwrap();
//! assert_eq!(*m.value, 2);
//! assert_eq!(m.param("id"), Some("123"));
//!
//! let m = router.find("GET", "/static/css/app.css").unwrap();
//! assert_eq!(*m.value, 3);
//! assert_eq!(m.param("*"), Some("css/app.css"));
//! ```

#![forbid(unsafe_code)]

mod pattern;

pub use pattern::{
    build, check, normalize, percent_decode, split_path, validate, PatternError, WILDCARD_KEY,
};

use std::borrow::Cow;
use std::collections::HashMap;

/// Compiled pattern segment
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param(String),
    Wildcard,
}

impl Segment {
    fn parse(raw: &str) -> Self {
        if raw == WILDCARD_KEY {
            Segment::Wildcard
        } else if let Some(name) = raw.strip_prefix(':') {
            Segment::Param(name.to_string())
        } else {
            Segment::Static(raw.to_string())
        }
    }
}

/// A registered route
#[derive(Debug, Clone)]
pub struct Route<T> {
    method: String,
    pattern: String,
    segments: Vec<Segment>,
    value: T,
}

impl<T> Route<T> {
    /// Uppercase method token
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Normalized pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Match decoded request segments against this route, collecting bindings
    fn matches(&self, parts: &[Cow<'_, str>]) -> Option<Vec<(String, String)>> {
        let mut params = Vec::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Wildcard => {
                    // Remainder may be empty: `/files/*` also answers `/files`
                    let rest = parts.get(i..).map(|r| r.join("/")).unwrap_or_default();
                    params.push((WILDCARD_KEY.to_string(), rest));
                    return Some(params);
                }
                Segment::Param(name) => {
                    let value = parts.get(i)?;
                    params.push((name.clone(), value.to_string()));
                }
                Segment::Static(expected) => {
                    if parts.get(i)? != expected {
                        return None;
                    }
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }
}

/// Result of a successful lookup
#[derive(Debug)]
pub struct Match<'a, T> {
    /// Value stored with the matched route
    pub value: &'a T,
    /// Pattern of the matched route
    pub pattern: &'a str,
    /// Bound parameters in pattern order
    pub params: Vec<(String, String)>,
}

impl<T> Match<'_, T> {
    /// Look up a bound parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Bound parameters as a map
    pub fn params_map(&self) -> HashMap<String, String> {
        self.params.iter().cloned().collect()
    }
}

/// Ordered route table
#[derive(Debug, Clone)]
pub struct Router<T> {
    routes: Vec<Route<T>>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Router<T> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a route
    ///
    /// The pattern is normalized then validated. Rejected patterns leave the
    /// table untouched. Duplicate method/pattern pairs are kept; the earlier
    /// one keeps winning. The method is stored uppercased.
    pub fn insert(&mut self, method: &str, pattern: &str, value: T) -> Result<(), PatternError> {
        let pattern = normalize(pattern);
        check(&pattern)?;

        let segments = split_path(&pattern).into_iter().map(Segment::parse).collect();

        self.routes.push(Route {
            method: method.to_ascii_uppercase(),
            pattern,
            segments,
            value,
        });
        Ok(())
    }

    /// Find the first route matching the method and path
    ///
    /// The path is normalized, split, then each segment is percent-decoded,
    /// so an encoded `/` never starts a new segment. Methods compare exactly.
    /// Query strings must already be stripped by the caller.
    pub fn find(&self, method: &str, path: &str) -> Option<Match<'_, T>> {
        let path = normalize(path);
        let parts: Vec<Cow<'_, str>> = split_path(&path).into_iter().map(percent_decode).collect();

        self.routes
            .iter()
            .filter(|r| r.method == method)
            .find_map(|r| {
                r.matches(&parts).map(|params| Match {
                    value: &r.value,
                    pattern: &r.pattern,
                    params,
                })
            })
    }

    /// Registered routes in order
    pub fn routes(&self) -> &[Route<T>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Check if any route is registered for a method
    pub fn has_method(&self, method: &str) -> bool {
        self.routes.iter().any(|r| r.method == method)
    }

    /// Distinct methods in first-registration order
    pub fn methods(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for r in &self.routes {
            if !out.contains(&r.method.as_str()) {
                out.push(&r.method);
            }
        }
        out
    }
}
