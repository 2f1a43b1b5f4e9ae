#![forbid(unsafe_code)]

//! Dotted-path handling.
//!
//! Paths address positions in the trait tree as separator-joined segment
//! lists. The separator is configured per store (default `"."`) and may be
//! longer than one byte; parsing and reconstruction always go through the
//! same separator within one store instance.

/// Split a path into its segments.
#[must_use]
pub fn segments<'a>(path: &'a str, separator: &str) -> Vec<&'a str> {
    path.split(separator).collect()
}

/// The first segment of a path.
#[must_use]
pub fn root_of<'a>(path: &'a str, separator: &str) -> &'a str {
    path.split(separator).next().unwrap_or(path)
}

/// Join a parent path and a child key.
#[must_use]
pub fn join(parent: &str, key: &str, separator: &str) -> String {
    let mut joined = String::with_capacity(parent.len() + separator.len() + key.len());
    joined.push_str(parent);
    joined.push_str(separator);
    joined.push_str(key);
    joined
}

/// The incremental ancestor chain of a path, root first.
///
/// `"a.b.c"` yields `["a", "a.b", "a.b.c"]`. Broadcast walks this chain so
/// that subscribers closer to the root are notified before deeper ones.
#[must_use]
pub fn ancestor_chain(path: &str, separator: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut incremental = String::new();
    for segment in path.split(separator) {
        if !incremental.is_empty() {
            incremental.push_str(separator);
        }
        incremental.push_str(segment);
        chain.push(incremental.clone());
    }
    chain
}
