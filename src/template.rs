use std::collections::BTreeMap;

use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error("template syntax error: {0}")]
    Syntax(String),
    #[error("template references undefined variable {0:?}")]
    MissingVariable(String),
}

/// A parsed substitution template. Placeholders are `{{ key_field }}` with
/// optional surrounding whitespace; everything else is copied through.
/// Rendering a placeholder with no matching variable is an error, never an
/// empty-string expansion.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Variable(String),
}

impl Template {
    /// Parse template text, catching unterminated or empty placeholders up
    /// front so config typos fail at load time instead of mid-pass.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                TemplateError::Syntax(format!(
                    "unterminated placeholder starting at {:?}",
                    truncate(&rest[start..], 20)
                ))
            })?;
            let name = after[..end].trim();
            if name.is_empty() {
                return Err(TemplateError::Syntax("empty placeholder".to_string()));
            }
            if name.contains('{') || name.contains('}') {
                return Err(TemplateError::Syntax(format!(
                    "malformed placeholder {:?}",
                    name
                )));
            }
            segments.push(Segment::Variable(name.to_string()));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, vars: &BTreeMap<String, Value>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => {
                    let value = vars
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingVariable(name.clone()))?;
                    out.push_str(&value_to_string(value));
                }
            }
        }
        Ok(out)
    }
}

/// Secret values are JSON; strings render bare, everything else renders as
/// its JSON encoding.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
