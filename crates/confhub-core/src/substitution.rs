//! Variable substitution
//!
//! Expands placeholders embedded in configuration values:
//! - `${user}` - id of the context's principal
//! - `${group_path}` - group path of the context's principal
//! - `${repository}` - id of the context's target repository
//! - `${env:NAME}` - process environment variable
//! - `${conf:KEY}` - global setting
//! - `${name:arg,default=value}` - fallback when the variable is unresolved
//! - `\${...}` - escaped, kept as is
//!
//! Unresolved placeholders are left verbatim. Substitution is idempotent:
//! any `${` produced by an expanded variable is emitted escaped, so a
//! second pass finds nothing new to expand.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ResolutionContext;
use crate::settings::GlobalSettings;
use crate::value::Value;

/// Contract of the substitution engine consumed by the service
pub trait VariableSubstitution: Send + Sync {
    /// Expand placeholders in `value` for `ctx`.
    ///
    /// Must be idempotent and deterministic for a given process state.
    fn substitute(&self, value: &Value, ctx: &ResolutionContext) -> Value;
}

/// Resolves one variable from its optional argument and the context
pub type VariableSource =
    Arc<dyn Fn(Option<&str>, &ResolutionContext) -> Option<String> + Send + Sync>;

/// A parsed piece of a raw string value
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// Plain text
    Literal(String),
    /// `\${`, kept escaped
    Escaped,
    /// `${name:arg,key=value}`
    Placeholder {
        raw: String,
        name: String,
        arg: Option<String>,
        default: Option<String>,
    },
}

/// Parser for placeholder expressions
struct PlaceholderParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> PlaceholderParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(mut self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut literal = String::new();

        while !self.is_eof() {
            if self.rest().starts_with("\\${") {
                flush(&mut literal, &mut segments);
                segments.push(Segment::Escaped);
                self.pos += 3;
            } else if self.rest().starts_with("${") {
                match self.parse_placeholder() {
                    Some(placeholder) => {
                        flush(&mut literal, &mut segments);
                        segments.push(placeholder);
                    }
                    None => {
                        // Unterminated, keep the rest as text
                        literal.push_str(self.rest());
                        self.pos = self.input.len();
                    }
                }
            } else if let Some(c) = self.rest().chars().next() {
                literal.push(c);
                self.pos += c.len_utf8();
            }
        }

        flush(&mut literal, &mut segments);
        segments
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    /// Parse `${...}` at the current position.
    ///
    /// Braces inside the body must balance, so `${env:X,default={a}}`
    /// has the default `{a}`.
    fn parse_placeholder(&mut self) -> Option<Segment> {
        let body_start = self.pos + 2;
        let close = matching_brace(&self.input[body_start..])? + body_start;
        let raw = self.input[self.pos..=close].to_string();
        let body = &self.input[body_start..close];
        self.pos = close + 1;

        let mut parts = body.split(',');
        let head = parts.next().unwrap_or_default().trim();
        let (name, arg) = match head.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim().to_string())),
            None => (head, None),
        };

        let mut default = None;
        for part in parts {
            if let Some(("default", value)) = part.split_once('=').map(|(k, v)| (k.trim(), v)) {
                default = Some(value.trim().to_string());
            }
        }

        if name.is_empty() {
            return Some(Segment::Literal(raw));
        }

        Some(Segment::Placeholder {
            raw,
            name: name.to_string(),
            arg,
            default,
        })
    }
}

/// Byte offset of the `}` closing an already opened brace
fn matching_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in body.char_indices() {
        match c {
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn flush(literal: &mut String, segments: &mut Vec<Segment>) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}

/// Check if a string needs processing (has placeholders or escapes)
pub fn needs_processing(input: &str) -> bool {
    input.contains("${")
}

/// Escape every `${` in expanded text
fn escape_expanded(text: &str) -> String {
    text.replace("${", "\\${")
}

/// Append `text`, escaping a trailing `$` of `output` that would start a
/// placeholder together with a leading `{` of `text`.
///
/// A `$` ending one segment and a `{` starting the next are never adjacent
/// in the input, so the pair only appears around an expansion, possibly an
/// empty one.
fn push_joined(output: &mut String, text: &str) {
    if text.starts_with('{') && output.ends_with('$') && !output.ends_with("\\$") {
        output.pop();
        output.push_str("\\$");
    }
    output.push_str(text);
}

/// The built-in substitution engine
#[derive(Clone)]
pub struct PlaceholderSubstitution {
    sources: HashMap<String, VariableSource>,
}

impl Default for PlaceholderSubstitution {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderSubstitution {
    /// Engine without any variable sources
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    /// Engine with the built-in sources, reading `${conf:...}` from `settings`
    pub fn with_builtins(settings: Arc<GlobalSettings>) -> Self {
        let mut engine = Self::new();
        engine.register_fn("user", |_, ctx| ctx.principal().map(|p| p.id().to_string()));
        engine.register_fn("group_path", |_, ctx| {
            ctx.principal()
                .and_then(|p| p.group_path())
                .map(str::to_string)
        });
        engine.register_fn("repository", |_, ctx| ctx.repository_id().map(str::to_string));
        engine.register_fn("env", |arg, _| arg.and_then(|name| std::env::var(name).ok()));
        engine.register_fn("conf", move |arg, _| {
            arg.and_then(|key| settings.get(key)).map(|v| v.to_string())
        });
        engine
    }

    /// Register a variable source, replacing any source with the same name
    pub fn register_fn<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(Option<&str>, &ResolutionContext) -> Option<String> + Send + Sync + 'static,
    {
        self.sources.insert(name.into(), Arc::new(func));
    }

    fn substitute_str(&self, input: &str, ctx: &ResolutionContext) -> String {
        if !needs_processing(input) {
            return input.to_string();
        }

        let mut output = String::with_capacity(input.len());
        for segment in PlaceholderParser::new(input).parse() {
            let text = match segment {
                Segment::Literal(text) => text,
                Segment::Escaped => "\\${".to_string(),
                Segment::Placeholder {
                    raw,
                    name,
                    arg,
                    default,
                } => {
                    let resolved = self
                        .sources
                        .get(&name)
                        .and_then(|source| source(arg.as_deref(), ctx))
                        .or(default);
                    match resolved {
                        Some(text) => escape_expanded(&text),
                        None => {
                            log::trace!("Leaving unresolved placeholder {}", raw);
                            raw
                        }
                    }
                }
            };
            push_joined(&mut output, &text);
        }
        output
    }
}

impl VariableSubstitution for PlaceholderSubstitution {
    fn substitute(&self, value: &Value, ctx: &ResolutionContext) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute_str(s, ctx)),
            Value::Sequence(seq) => {
                Value::Sequence(seq.iter().map(|v| self.substitute(v, ctx)).collect())
            }
            Value::Mapping(map) => Value::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute(v, ctx)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
