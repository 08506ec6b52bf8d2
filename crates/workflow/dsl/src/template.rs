//! Parameter templates: text with embedded `{{ ... }}` context references

use crate::context::{ConditionContext, ContextRef, Value};
use crate::errors::{DslError, DslResult};

/// A piece of a parsed template
#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Text(String),
    Reference(ContextRef),
}

/// Parsed template text
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> DslResult<Self> {
        let mut segments = Vec::new();
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| DslError::ParseError {
                line: 1,
                col: text.len() - rest.len() + start + 1,
                message: "Unterminated parameter, expected '}}'".into(),
            })?;
            segments.push(Segment::Reference(ContextRef::parse(&after[..end])?));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_references(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Reference(_)))
    }

    /// A template made of one reference followed by optional literal text,
    /// as used by artifact sources: `{{ ref }}/suffix`
    pub fn as_reference_with_suffix(&self) -> Option<(&ContextRef, String)> {
        let (first, tail) = self.segments.split_first()?;
        let reference = match first {
            Segment::Reference(r) => r,
            Segment::Text(_) => return None,
        };
        let mut suffix = String::new();
        for segment in tail {
            match segment {
                Segment::Text(t) => suffix.push_str(t),
                Segment::Reference(_) => return None,
            }
        }
        Some((reference, suffix))
    }

    /// Substitute every reference; undefined and null values render empty
    pub fn render(&self, ctx: &dyn ConditionContext) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Reference(r) => match ctx.resolve(r) {
                    Value::Undefined | Value::Null => {}
                    value => out.push_str(&value.to_string()),
                },
            }
        }
        out
    }
}

/// Parse and render in one step
pub fn render(text: &str, ctx: &dyn ConditionContext) -> DslResult<String> {
    Ok(Template::parse(text)?.render(ctx))
}
