//! URI pattern trie
//!
//! Patterns are segment paths supporting three shapes:
//! - exact: `/hello/world`
//! - parameterized segments: `/user/:id/profile` (`:id` captures one segment)
//! - prefix: a trailing `*` makes everything before it a string prefix,
//!   so `/static*` matches `/staticfile` and `/static/js/app.js`, and
//!   `/api/*` matches anything under `/api`.
//!
//! A lookup returns every pattern that matches, with captured parameters
//! and a specificity rank so the caller can order candidates.

use std::collections::HashMap;

/// How a pattern matched; exact beats prefix at equal route priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatternKind {
    Prefix,
    Exact,
}

/// One value stored at a trie position
struct Entry<T> {
    value: T,
    /// Parameter names in capture order
    params: Vec<String>,
    kind: PatternKind,
    pattern_len: usize,
}

/// Prefix pattern anchored at a node: the remaining path must start with
/// `rest_prefix`
struct Glued<T> {
    rest_prefix: String,
    entries: Vec<Entry<T>>,
}

struct Node<T> {
    literal: HashMap<String, Node<T>>,
    param: Option<Box<Node<T>>>,
    glued: Vec<Glued<T>>,
    terminal: Vec<Entry<T>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            literal: HashMap::new(),
            param: None,
            glued: Vec::new(),
            terminal: Vec::new(),
        }
    }
}

/// A successful pattern match
pub struct PatternMatch<'a, T> {
    pub value: &'a T,
    pub params: HashMap<String, String>,
    pub kind: PatternKind,
    /// Length of the source pattern; longer wins among equal kinds
    pub pattern_len: usize,
}

/// Trie over URI patterns; values of matching patterns are collected on
/// lookup rather than reduced, so tie-breaking stays with the caller.
pub struct PathTrie<T> {
    root: Node<T>,
    len: usize,
}

impl<T> PathTrie<T> {
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Number of inserted patterns
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, pattern: &str, value: T) {
        let pattern_len = pattern.len();

        let (body, prefix) = match pattern.strip_suffix('*') {
            Some(body) => (body, true),
            None => (pattern, false),
        };

        // Walk whole segments; for prefix patterns the trailing partial
        // segment becomes the glued rest-prefix at its parent node.
        let mut segments: Vec<&str> = body.split('/').filter(|s| !s.is_empty()).collect();
        let glued_rest = if prefix {
            if body.ends_with('/') || body.is_empty() {
                Some(String::new())
            } else {
                Some(segments.pop().unwrap_or("").to_string())
            }
        } else {
            None
        };

        let mut params = Vec::new();
        let mut node = &mut self.root;
        for seg in segments {
            if let Some(name) = seg.strip_prefix(':') {
                params.push(name.to_string());
                node = node.param.get_or_insert_with(|| Box::new(Node::new()));
            } else {
                node = node.literal.entry(seg.to_string()).or_insert_with(Node::new);
            }
        }

        let entry = Entry {
            value,
            params,
            kind: if prefix {
                PatternKind::Prefix
            } else {
                PatternKind::Exact
            },
            pattern_len,
        };

        match glued_rest {
            Some(rest_prefix) => {
                match node.glued.iter_mut().find(|g| g.rest_prefix == rest_prefix) {
                    Some(glued) => glued.entries.push(entry),
                    None => node.glued.push(Glued {
                        rest_prefix,
                        entries: vec![entry],
                    }),
                }
            }
            None => node.terminal.push(entry),
        }
        self.len += 1;
    }

    /// Collect every pattern matching `path`
    pub fn matches<'a>(&'a self, path: &str) -> Vec<PatternMatch<'a, T>> {
        let rest = path.strip_prefix('/').unwrap_or(path);
        let mut out = Vec::new();
        let mut captured = Vec::new();
        walk(&self.root, rest, &mut captured, &mut out);
        out
    }
}

impl<T> Default for PathTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn walk<'a, T>(
    node: &'a Node<T>,
    rest: &str,
    captured: &mut Vec<String>,
    out: &mut Vec<PatternMatch<'a, T>>,
) {
    // Prefix patterns anchored here match against the remaining path
    for glued in &node.glued {
        if rest.starts_with(glued.rest_prefix.as_str()) {
            for entry in &glued.entries {
                out.push(to_match(entry, captured));
            }
        }
    }

    if rest.is_empty() {
        for entry in &node.terminal {
            out.push(to_match(entry, captured));
        }
        return;
    }

    let (seg, tail) = match rest.split_once('/') {
        Some((seg, tail)) => (seg, tail),
        None => (rest, ""),
    };
    if seg.is_empty() {
        // Collapse duplicate slashes
        walk(node, tail, captured, out);
        return;
    }

    if let Some(child) = node.literal.get(seg) {
        walk(child, tail, captured, out);
    }
    if let Some(param_child) = &node.param {
        captured.push(seg.to_string());
        walk(param_child, tail, captured, out);
        captured.pop();
    }
}

fn to_match<'a, T>(entry: &'a Entry<T>, captured: &[String]) -> PatternMatch<'a, T> {
    let params = entry
        .params
        .iter()
        .cloned()
        .zip(captured.iter().cloned())
        .collect();
    PatternMatch {
        value: &entry.value,
        params,
        kind: entry.kind,
        pattern_len: entry.pattern_len,
    }
}
