//! Variable resolution across argument, stage, session, and environment scopes.
//!
//! A reference is `$` + uppercase scope (`ARG`, `STAGE`, `CONTEXT`, `ENV`)
//! + `_` + a dotted path. References are substituted greedily, left to
//! right, in one regex pass per string; arrays and mappings are walked
//! recursively. A string that consists of exactly one reference resolves
//! to the referenced value itself, preserving its type, so stage outputs
//! can flow between stages without stringification.

use crate::error::{EngineError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;

static VARIABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(ARG|STAGE|CONTEXT|ENV)_([A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]+)*)")
        .expect("variable reference regex")
});

/// Literal substituted for missing `$ARG_*` and `$CONTEXT_*` paths, so
/// optional arguments are safe in templates without conditionals.
pub const NOT_SPECIFIED: &str = "Not specified";

/// A single variable reference extracted from a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRef {
    /// The full matched text, e.g. `$STAGE_analyze.summary`.
    pub full: String,
    /// The scope, e.g. `STAGE`.
    pub scope: String,
    /// The dotted path, e.g. `analyze.summary`.
    pub path: String,
}

/// Extract every variable reference from a string, in order.
pub fn extract_variables(s: &str) -> Vec<VariableRef> {
    VARIABLE_RE
        .captures_iter(s)
        .map(|cap| VariableRef {
            full: cap[0].to_string(),
            scope: cap[1].to_string(),
            path: cap[2].to_string(),
        })
        .collect()
}

/// Whether the string contains at least one variable reference.
pub fn has_variables(s: &str) -> bool {
    VARIABLE_RE.is_match(s)
}

/// Whether any string inside the value references the given scope.
pub fn references_scope(value: &Value, scope: &str) -> bool {
    match value {
        Value::String(s) => extract_variables(s).iter().any(|v| v.scope == scope),
        Value::Array(items) => items.iter().any(|v| references_scope(v, scope)),
        Value::Object(map) => map.values().any(|v| references_scope(v, scope)),
        _ => false,
    }
}

/// Convert a name to kebab-case, splitting camelCase boundaries.
fn to_kebab(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch == '_' || ch == '-' {
            out.push('-');
        } else if ch.is_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Convert a name to snake_case, splitting camelCase boundaries.
fn to_snake(name: &str) -> String {
    to_kebab(name).replace('-', "_")
}

/// The four disjoint variable scopes.
///
/// Stage records are append-only: [`VariableContext::add_stage_outputs`]
/// is the only mutation path and never rewrites an existing key.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    args: Map<String, Value>,
    stages: HashMap<String, Map<String, Value>>,
    context: Map<String, Value>,
    env: HashMap<String, String>,
}

impl VariableContext {
    /// An empty context with a snapshot of the process environment.
    pub fn new() -> Self {
        Self {
            env: std::env::vars().collect(),
            ..Default::default()
        }
    }

    /// Replace the environment snapshot (tests, hermetic runs).
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Store positional arguments under the keys "1", "2", ...
    pub fn set_positional_args(&mut self, args: &[Value]) {
        for (i, value) in args.iter().enumerate() {
            self.args.insert((i + 1).to_string(), value.clone());
        }
    }

    /// Store a named argument under its original, kebab-case, and
    /// snake_case spellings, absorbing CLI convention drift.
    pub fn set_named_arg(&mut self, name: &str, value: Value) {
        self.args.insert(name.to_string(), value.clone());
        self.args.insert(to_kebab(name), value.clone());
        self.args.insert(to_snake(name), value);
    }

    pub fn set_context_value(&mut self, key: &str, value: Value) {
        self.context.insert(key.to_string(), value);
    }

    /// Append outputs for a stage. Existing keys are never rewritten.
    pub fn add_stage_outputs(&mut self, stage: &str, outputs: &Map<String, Value>) {
        let record = self.stages.entry(stage.to_string()).or_default();
        for (key, value) in outputs {
            record.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    pub fn has_stage(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    pub fn stage_outputs(&self, stage: &str) -> Option<&Map<String, Value>> {
        self.stages.get(stage)
    }
}

/// Resolves `$SCOPE_PATH` references against a [`VariableContext`].
///
/// Strict by default: `$ENV_*` misses and missing properties of a known
/// stage raise [`EngineError::VariableNotFound`]. Non-strict mode leaves
/// such references as literal text (diagnostic paths only).
#[derive(Debug)]
pub struct VariableResolver {
    ctx: VariableContext,
    strict: bool,
}

impl VariableResolver {
    pub fn new(ctx: VariableContext) -> Self {
        Self { ctx, strict: true }
    }

    /// Leave unresolvable references in place instead of failing.
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn context(&self) -> &VariableContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut VariableContext {
        &mut self.ctx
    }

    /// Resolve every reference inside a value, walking arrays and
    /// mappings recursively. Non-string leaves are returned as-is.
    pub fn resolve(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::Array(items) => Ok(Value::Array(
                items.iter().map(|v| self.resolve(v)).collect::<Result<_>>()?,
            )),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve all references in an input mapping.
    pub fn resolve_inputs(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = Map::with_capacity(inputs.len());
        for (k, v) in inputs {
            out.insert(k.clone(), self.resolve(v)?);
        }
        Ok(out)
    }

    /// Resolve a single string. A string that is exactly one reference
    /// yields the referenced value with its type preserved; otherwise
    /// every reference is substituted with its string coercion.
    pub fn resolve_string(&self, s: &str) -> Result<Value> {
        if let Some(cap) = VARIABLE_RE.captures(s) {
            if cap[0].len() == s.len() {
                return self.lookup(&cap[1], &cap[2], s);
            }
        }

        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for cap in VARIABLE_RE.captures_iter(s) {
            let m = cap.get(0).expect("capture group 0");
            out.push_str(&s[last..m.start()]);
            let resolved = self.lookup(&cap[1], &cap[2], m.as_str())?;
            out.push_str(&coerce_to_string(&resolved));
            last = m.end();
        }
        out.push_str(&s[last..]);
        Ok(Value::String(out))
    }

    /// Collect a message for every unresolvable reference, without mutating.
    pub fn validate_variables(&self, value: &Value) -> Vec<String> {
        let mut messages = Vec::new();
        self.collect_unresolvable(value, &mut messages);
        messages
    }

    fn collect_unresolvable(&self, value: &Value, messages: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                for var in extract_variables(s) {
                    if let Err(e) = self.lookup_strict(&var.scope, &var.path) {
                        messages.push(e.to_string());
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.collect_unresolvable(item, messages);
                }
            }
            Value::Object(map) => {
                for v in map.values() {
                    self.collect_unresolvable(v, messages);
                }
            }
            _ => {}
        }
    }

    fn lookup(&self, scope: &str, path: &str, full: &str) -> Result<Value> {
        match self.lookup_strict(scope, path) {
            Ok(v) => Ok(v),
            Err(e) if self.strict => Err(e),
            Err(_) => Ok(Value::String(full.to_string())),
        }
    }

    fn lookup_strict(&self, scope: &str, path: &str) -> Result<Value> {
        match scope {
            "ARG" => Ok(lookup_lenient(&self.ctx.args, path)),
            "CONTEXT" => Ok(lookup_lenient(&self.ctx.context, path)),
            "STAGE" => self.lookup_stage(path),
            "ENV" => self
                .ctx
                .env
                .get(path)
                .map(|v| Value::String(v.clone()))
                .ok_or_else(|| EngineError::VariableNotFound {
                    scope: "ENV".into(),
                    path: path.into(),
                    available: vec![],
                }),
            other => Err(EngineError::VariableNotFound {
                scope: other.into(),
                path: path.into(),
                available: vec![],
            }),
        }
    }

    fn lookup_stage(&self, path: &str) -> Result<Value> {
        let mut segments = path.split('.');
        let stage = segments.next().unwrap_or_default();

        // Unknown stage: conditionally-skipped upstreams resolve to null
        // so downstream stages degrade gracefully.
        let Some(outputs) = self.ctx.stages.get(stage) else {
            return Ok(Value::Null);
        };

        let mut current = Value::Object(outputs.clone());
        for segment in segments {
            let next = match &current {
                Value::Object(map) => map.get(segment).cloned(),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => {
                    let available = match &current {
                        Value::Object(map) => map.keys().cloned().collect(),
                        _ => vec![],
                    };
                    return Err(EngineError::VariableNotFound {
                        scope: "STAGE".into(),
                        path: path.into(),
                        available,
                    });
                }
            }
        }
        Ok(current)
    }
}

fn lookup_lenient(map: &Map<String, Value>, path: &str) -> Value {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let Some(mut current) = map.get(first).cloned() else {
        return Value::String(NOT_SPECIFIED.into());
    };
    for segment in segments {
        match current {
            Value::Object(ref obj) => match obj.get(segment) {
                Some(v) => current = v.clone(),
                None => return Value::String(NOT_SPECIFIED.into()),
            },
            _ => return Value::String(NOT_SPECIFIED.into()),
        }
    }
    current
}

/// Render a value as it appears inside a substituted string.
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
