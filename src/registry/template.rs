//! URI template compilation and matching
//!
//! Templates address resources with named variable slots, e.g.
//! `kb://{collection}/stats`. Literals match case-sensitively; a variable
//! captures a non-empty run of characters up to the next literal delimiter.
//! Captures are raw strings; type coercion happens in the dispatcher.

use std::collections::HashMap;

use crate::error::{AlmanacError, Result};

/// Parameter bindings extracted from a matched address
pub type ParamMap = HashMap<String, String>;

/// One piece of a path segment
#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Variable(String),
}

/// A path segment: alternating literal and variable parts. Adjacent
/// variables are rejected at compile time, so the alternation always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    parts: Vec<Part>,
}

impl Segment {
    fn has_variable(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Variable(_)))
    }

    fn literal_text(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [Part::Literal(text)] => Some(text),
            _ => None,
        }
    }

    /// Match this segment against concrete text, appending captures.
    /// Variable captures take the shortest run: a variable followed by a
    /// literal captures up to the first occurrence of that literal.
    fn match_text(&self, text: &str, params: &mut ParamMap) -> bool {
        let mut pos = 0;
        let mut parts = self.parts.iter().peekable();

        while let Some(part) = parts.next() {
            match part {
                Part::Literal(lit) => {
                    if !text[pos..].starts_with(lit.as_str()) {
                        return false;
                    }
                    pos += lit.len();
                }
                Part::Variable(name) => match parts.peek() {
                    // Trailing variable captures the rest of the segment
                    None => {
                        if pos == text.len() {
                            return false;
                        }
                        params.insert(name.clone(), text[pos..].to_string());
                        pos = text.len();
                    }
                    Some(Part::Literal(lit)) => {
                        let Some(found) = text[pos..].find(lit.as_str()) else {
                            return false;
                        };
                        if found == 0 {
                            // Empty captures never match
                            return false;
                        }
                        params.insert(name.clone(), text[pos..pos + found].to_string());
                        pos += found;
                    }
                    Some(Part::Variable(_)) => unreachable!("adjacent variables rejected at compile"),
                },
            }
        }

        pos == text.len()
    }
}

/// A compiled address template owned by one templated resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    pattern: String,
    scheme: String,
    segments: Vec<Segment>,
    variables: Vec<String>,
}

impl UriTemplate {
    /// Compile a pattern like `kb://{collection}/entries/{id}`.
    ///
    /// Rejected: missing scheme, empty variable names, unbalanced braces,
    /// duplicate variable names, and adjacent variables with no literal
    /// separator (their boundary would be undecidable).
    pub fn compile(pattern: &str) -> Result<UriTemplate> {
        let (scheme, rest) = split_scheme(pattern)?;
        if rest.is_empty() {
            return Err(AlmanacError::Template(format!(
                "template '{pattern}' has an empty path"
            )));
        }

        let mut variables: Vec<String> = Vec::new();
        let mut segments = Vec::new();

        for raw in rest.split('/') {
            let segment = parse_segment(pattern, raw, &mut variables)?;
            segments.push(segment);
        }

        Ok(UriTemplate {
            pattern: pattern.to_string(),
            scheme: scheme.to_string(),
            segments,
            variables,
        })
    }

    /// The original pattern string
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Variable names in declaration order
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Match a concrete address, extracting raw string bindings.
    /// Returns `None` when the address does not belong to this template.
    pub fn match_uri(&self, uri: &str) -> Option<ParamMap> {
        let (scheme, rest) = split_scheme(uri).ok()?;
        if scheme != self.scheme {
            return None;
        }

        let texts: Vec<&str> = rest.split('/').collect();
        if texts.len() != self.segments.len() {
            return None;
        }

        let mut params = ParamMap::new();
        for (segment, text) in self.segments.iter().zip(&texts) {
            if !segment.match_text(text, &mut params) {
                return None;
            }
        }
        Some(params)
    }

    /// Substitute bindings back into the pattern. Every variable must be
    /// bound; values must not contain the `/` delimiter.
    pub fn expand(&self, bindings: &ParamMap) -> Result<String> {
        let mut out = format!("{}://", self.scheme);
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            for part in &segment.parts {
                match part {
                    Part::Literal(lit) => out.push_str(lit),
                    Part::Variable(name) => {
                        let value = bindings.get(name).ok_or_else(|| {
                            AlmanacError::Template(format!("unbound variable '{name}'"))
                        })?;
                        if value.is_empty() || value.contains('/') {
                            return Err(AlmanacError::Template(format!(
                                "illegal value for variable '{name}'"
                            )));
                        }
                        out.push_str(value);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Structural overlap check used by the registry at startup: could any
    /// concrete address match both templates? Conservative where two mixed
    /// segments both carry variables.
    pub fn overlaps(&self, other: &UriTemplate) -> bool {
        if self.scheme != other.scheme || self.segments.len() != other.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(&other.segments)
            .all(|(a, b)| segments_compatible(a, b))
    }
}

fn split_scheme(input: &str) -> Result<(&str, &str)> {
    let Some((scheme, rest)) = input.split_once("://") else {
        return Err(AlmanacError::Template(format!(
            "'{input}' is missing a scheme"
        )));
    };
    if scheme.is_empty() {
        return Err(AlmanacError::Template(format!(
            "'{input}' has an empty scheme"
        )));
    }
    Ok((scheme, rest))
}

fn parse_segment(pattern: &str, raw: &str, variables: &mut Vec<String>) -> Result<Segment> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') => {
                            return Err(AlmanacError::Template(format!(
                                "template '{pattern}' has a nested '{{'"
                            )))
                        }
                        Some(c) => name.push(c),
                        None => {
                            return Err(AlmanacError::Template(format!(
                                "template '{pattern}' has an unclosed variable"
                            )))
                        }
                    }
                }
                if name.is_empty() {
                    return Err(AlmanacError::Template(format!(
                        "template '{pattern}' has an empty variable name"
                    )));
                }
                if variables.iter().any(|v| v == &name) {
                    return Err(AlmanacError::Template(format!(
                        "template '{pattern}' repeats variable '{name}'"
                    )));
                }
                if matches!(parts.last(), Some(Part::Variable(_))) {
                    return Err(AlmanacError::Template(format!(
                        "template '{pattern}' has adjacent variables with no separator"
                    )));
                }
                variables.push(name.clone());
                parts.push(Part::Variable(name));
            }
            '}' => {
                return Err(AlmanacError::Template(format!(
                    "template '{pattern}' has an unmatched '}}'"
                )))
            }
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }
    if parts.is_empty() {
        parts.push(Part::Literal(String::new()));
    }

    Ok(Segment { parts })
}

/// Can some string satisfy both segments? Exact check when at least one side
/// is a pure literal; conservative `true` when both carry variables, which
/// errs on the side of refusing to register rather than matching ambiguously.
fn segments_compatible(a: &Segment, b: &Segment) -> bool {
    match (a.literal_text(), b.literal_text()) {
        (Some(la), Some(lb)) => la == lb,
        (Some(lit), None) => b.match_text(lit, &mut ParamMap::new()),
        (None, Some(lit)) => a.match_text(lit, &mut ParamMap::new()),
        (None, None) => a.has_variable() && b.has_variable(),
    }
}
