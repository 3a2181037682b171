//! Glob patterns compiled into a prefix tree of path components.

use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};

use crate::error::{Result, ViewError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobOptions {
    /// Let wildcards match names starting with `.`.
    pub include_dot_files: bool,
    pub case_insensitive: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum Segment {
    Literal(String),
    Wildcard(GlobMatcher),
    Doublestar(Continuations),
}

/// What may follow a `**`, split by whether the pattern spells out a
/// component starting with `.` itself.
#[derive(Debug, Clone)]
pub(crate) struct Continuations {
    plain: GlobSet,
    dotted: GlobSet,
}

fn names_a_dot_component(pattern: &str) -> bool {
    pattern.split('/').any(|c| c.starts_with('.'))
}

#[derive(Debug, Clone)]
pub struct GlobNode {
    pub(crate) pattern: String,
    pub(crate) segment: Segment,
    /// Some pattern ends at this component.
    pub(crate) is_leaf: bool,
    pub(crate) children: Vec<GlobNode>,
}

#[derive(Debug, Clone)]
pub struct GlobTree {
    pub(crate) root: GlobNode,
    pub(crate) options: GlobOptions,
}

fn has_wildcards(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{', '\\'])
}

fn build_glob(pattern: &str, options: GlobOptions) -> Result<globset::Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .case_insensitive(options.case_insensitive)
        .backslash_escape(true)
        .build()
        .map_err(|err| ViewError::InvalidGlob {
            pattern: pattern.to_string(),
            reason: err.kind().to_string(),
        })
}

/// Pattern text collected while building, compiled once all patterns are in.
struct PendingNode {
    pattern: String,
    doublestar: bool,
    is_leaf: bool,
    rest_patterns: Vec<String>,
    children: Vec<PendingNode>,
}

impl PendingNode {
    fn new(pattern: &str, doublestar: bool) -> Self {
        Self {
            pattern: pattern.to_string(),
            doublestar,
            is_leaf: false,
            rest_patterns: Vec::new(),
            children: Vec::new(),
        }
    }

    fn child(&mut self, pattern: &str, doublestar: bool) -> &mut PendingNode {
        let pos = self
            .children
            .iter()
            .position(|c| c.pattern == pattern && c.doublestar == doublestar);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                self.children.push(PendingNode::new(pattern, doublestar));
                self.children.len() - 1
            }
        };
        &mut self.children[pos]
    }

    fn compile(self, options: GlobOptions) -> Result<GlobNode> {
        let segment = if self.doublestar {
            let mut plain = GlobSetBuilder::new();
            let mut dotted = GlobSetBuilder::new();
            for rest in &self.rest_patterns {
                let glob = build_glob(rest, options)?;
                if names_a_dot_component(rest) {
                    dotted.add(glob);
                } else {
                    plain.add(glob);
                }
            }
            let build = |set: GlobSetBuilder| {
                set.build().map_err(|err| ViewError::InvalidGlob {
                    pattern: self.rest_patterns.join(", "),
                    reason: err.to_string(),
                })
            };
            Segment::Doublestar(Continuations {
                plain: build(plain)?,
                dotted: build(dotted)?,
            })
        } else if has_wildcards(&self.pattern) || options.case_insensitive {
            Segment::Wildcard(build_glob(&self.pattern, options)?.compile_matcher())
        } else {
            Segment::Literal(self.pattern.clone())
        };
        let children = self
            .children
            .into_iter()
            .map(|c| c.compile(options))
            .collect::<Result<Vec<_>>>()?;
        Ok(GlobNode {
            pattern: self.pattern,
            segment,
            is_leaf: self.is_leaf,
            children,
        })
    }
}

impl GlobTree {
    /// Compiles root-relative patterns such as `src/**/*.rs` into one tree.
    pub fn new<S: AsRef<str>>(patterns: &[S], options: GlobOptions) -> Result<Self> {
        let mut root = PendingNode::new("", false);
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let trimmed = pattern.trim_start_matches('/');
            let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
            if segments.is_empty() {
                return Err(ViewError::InvalidGlob {
                    pattern: pattern.to_string(),
                    reason: "pattern has no path components".to_string(),
                });
            }
            let mut node = &mut root;
            for (i, segment) in segments.iter().enumerate() {
                if *segment == "**" {
                    let rest = &segments[i..];
                    node = node.child("**", true);
                    node.rest_patterns.push(rest.join("/"));
                    break;
                }
                node = node.child(segment, false);
                if i == segments.len() - 1 {
                    node.is_leaf = true;
                }
            }
        }
        Ok(Self {
            root: root.compile(options)?,
            options,
        })
    }

    pub fn options(&self) -> GlobOptions {
        self.options
    }
}

impl GlobNode {
    /// Whether a single component `name` matches this node. Wildcards only
    /// match a leading `.` when the pattern starts with one or dot files
    /// are included.
    pub(crate) fn matches_name(&self, name: &str, options: GlobOptions) -> bool {
        match &self.segment {
            Segment::Literal(lit) => lit == name,
            Segment::Wildcard(matcher) => {
                let dot_ok = options.include_dot_files
                    || !name.starts_with('.')
                    || self.pattern.starts_with('.');
                dot_ok && matcher.is_match(name)
            }
            Segment::Doublestar(_) => false,
        }
    }

    /// For a `**` node: whether `rel` (relative to where the `**` began)
    /// matches any continuation.
    pub(crate) fn matches_rest(&self, rel: &str, options: GlobOptions) -> bool {
        match &self.segment {
            Segment::Doublestar(rest) => {
                if rest.dotted.is_match(rel) {
                    return true;
                }
                (options.include_dot_files || !names_a_dot_component(rel))
                    && rest.plain.is_match(rel)
            }
            _ => false,
        }
    }

    /// For a `**` node: whether the walk below it has to enter directories
    /// whose names start with `.`.
    pub(crate) fn enters_dot_dirs(&self, options: GlobOptions) -> bool {
        match &self.segment {
            Segment::Doublestar(rest) => options.include_dot_files || !rest.dotted.is_empty(),
            _ => options.include_dot_files,
        }
    }

    pub(crate) fn literal(&self) -> Option<&str> {
        match &self.segment {
            Segment::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    pub(crate) fn is_doublestar(&self) -> bool {
        matches!(self.segment, Segment::Doublestar(_))
    }
}
