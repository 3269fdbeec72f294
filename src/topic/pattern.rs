//! Compiled topic patterns
//!
//! A pattern is a `/`-separated list of segments. Each segment is one of:
//! - a literal, matched exactly
//! - `:name`, capturing exactly one non-empty level under `name`
//! - `+`, matching exactly one level
//! - `#`, matching zero or more trailing levels (final segment only)
//!
//! Patterns are compiled once and matched many times; matching never
//! allocates unless captures are requested.

use std::collections::HashMap;
use std::fmt;

/// Named parameters captured by a successful match
pub type Params = HashMap<String, String>;

/// Error returned when a pattern cannot be compiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// The pattern string is empty
    Empty,
    /// `#` appears somewhere other than the final segment
    MisplacedMultiLevel { pattern: String },
    /// `+` or `#` shares a segment with other characters
    PartialWildcard { pattern: String, segment: String },
    /// `:` is not followed by `[A-Za-z0-9_]+`
    InvalidCaptureName { pattern: String, segment: String },
    /// The same capture name is used twice
    DuplicateCapture { pattern: String, name: String },
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::Empty => write!(f, "topic pattern cannot be empty"),
            PatternError::MisplacedMultiLevel { pattern } => {
                write!(f, "'#' must be the last segment in '{}'", pattern)
            }
            PatternError::PartialWildcard { pattern, segment } => write!(
                f,
                "wildcard must occupy an entire segment ('{}' in '{}')",
                segment, pattern
            ),
            PatternError::InvalidCaptureName { pattern, segment } => write!(
                f,
                "invalid capture name '{}' in '{}'",
                segment, pattern
            ),
            PatternError::DuplicateCapture { pattern, name } => {
                write!(f, "capture ':{}' appears twice in '{}'", name, pattern)
            }
        }
    }
}

impl std::error::Error for PatternError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
    SingleLevel,
    MultiLevel,
}

/// A compiled topic pattern
#[derive(Debug, Clone)]
pub struct TopicPattern {
    source: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compile a pattern string
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let raw: Vec<&str> = pattern.split('/').collect();
        let mut segments = Vec::with_capacity(raw.len());

        for (i, &segment) in raw.iter().enumerate() {
            let compiled = match segment {
                "#" if i + 1 == raw.len() => Segment::MultiLevel,
                "#" => {
                    return Err(PatternError::MisplacedMultiLevel {
                        pattern: pattern.to_string(),
                    })
                }
                "+" => Segment::SingleLevel,
                s if s.contains(['+', '#']) => {
                    return Err(PatternError::PartialWildcard {
                        pattern: pattern.to_string(),
                        segment: s.to_string(),
                    })
                }
                s => match s.strip_prefix(':') {
                    Some(name) => {
                        if !is_valid_capture_name(name) {
                            return Err(PatternError::InvalidCaptureName {
                                pattern: pattern.to_string(),
                                segment: s.to_string(),
                            });
                        }
                        let duplicate = segments
                            .iter()
                            .any(|seg| matches!(seg, Segment::Capture(n) if n == name));
                        if duplicate {
                            return Err(PatternError::DuplicateCapture {
                                pattern: pattern.to_string(),
                                name: name.to_string(),
                            });
                        }
                        Segment::Capture(name.to_string())
                    }
                    None => Segment::Literal(s.to_string()),
                },
            };
            segments.push(compiled);
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as originally written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a topic, returning the captured parameters on success.
    ///
    /// A pattern without captures yields an empty map on success.
    pub fn matches(&self, topic: &str) -> Option<Params> {
        let mut params = Params::new();
        let matched = self.walk(topic, |name, level| {
            params.insert(name.to_string(), level.to_string());
        });
        matched.then_some(params)
    }

    /// Match a topic without collecting captures
    pub fn is_match(&self, topic: &str) -> bool {
        self.walk(topic, |_, _| {})
    }

    fn walk<'t, F>(&self, topic: &'t str, mut on_capture: F) -> bool
    where
        F: FnMut(&str, &'t str),
    {
        // $-topics are never matched by a leading wildcard or capture
        if topic.starts_with('$')
            && !matches!(self.segments.first(), Some(Segment::Literal(_)))
        {
            return false;
        }

        let mut levels = topic.split('/');
        for segment in &self.segments {
            if *segment == Segment::MultiLevel {
                return true;
            }

            let Some(level) = levels.next() else {
                return false;
            };

            match segment {
                Segment::Literal(literal) if literal != level => return false,
                Segment::Capture(_) if level.is_empty() => return false,
                Segment::Capture(name) => on_capture(name, level),
                _ => {}
            }
        }

        levels.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// True iff at least one rule matches the topic. An empty rule set never matches.
pub fn matches_any(rules: &[TopicPattern], topic: &str) -> bool {
    rules.iter().any(|rule| rule.is_match(topic))
}

/// Compile a list of patterns, failing on the first invalid one
pub fn compile_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<TopicPattern>, PatternError> {
    patterns
        .iter()
        .map(|p| TopicPattern::compile(p.as_ref()))
        .collect()
}

/// Check that a value can be spliced into a pattern as one literal segment
pub fn validate_literal_segment(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("value cannot be empty");
    }
    if value.contains(['/', '+', '#', '\0']) {
        return Err("value cannot contain '/', '+', '#' or null characters");
    }
    if value.starts_with(':') {
        return Err("value cannot start with ':'");
    }
    Ok(())
}

fn is_valid_capture_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
