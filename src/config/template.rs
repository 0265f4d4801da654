//! Transition-matrix path templates.
//!
//! Templates use format-style placeholders: `{}` takes the replica id and the
//! lag time in turn, `{0}`/`{1}` address them by position, and `{replica}` /
//! `{lag}` by name. `{{` and `}}` produce literal braces.

use std::fmt;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Replica,
    Lag,
}

/// A parsed path template parameterised by replica id and lag time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parse a template, rejecting ones that cannot tell units apart.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let fail = |reason: &str| ConfigError::Template {
            template: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut next_auto = 0usize;
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(fail("unclosed placeholder")),
                        }
                    }
                    let segment = match name.as_str() {
                        "" => {
                            let index = next_auto;
                            next_auto += 1;
                            positional(index).ok_or_else(|| {
                                fail("more than two {} placeholders (replica id, lag time)")
                            })?
                        }
                        "replica" => Segment::Replica,
                        "lag" => Segment::Lag,
                        other => match other.parse::<usize>() {
                            Ok(index) => positional(index).ok_or_else(|| {
                                fail("positional placeholders are {0} (replica id) and {1} (lag time)")
                            })?,
                            Err(_) => {
                                return Err(fail(&format!("unknown placeholder {{{}}}", other)))
                            }
                        },
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                '}' => return Err(fail("unmatched '}'")),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if !segments.contains(&Segment::Replica) {
            return Err(fail("no replica id placeholder"));
        }
        if !segments.contains(&Segment::Lag) {
            return Err(fail("no lag time placeholder"));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Substitute the placeholders for one unit.
    pub fn render(&self, replica_id: &str, lag_time: u64) -> String {
        let mut out = String::with_capacity(self.raw.len() + replica_id.len() + 8);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Replica => out.push_str(replica_id),
                Segment::Lag => out.push_str(&lag_time.to_string()),
            }
        }
        out
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn positional(index: usize) -> Option<Segment> {
    match index {
        0 => Some(Segment::Replica),
        1 => Some(Segment::Lag),
        _ => None,
    }
}
