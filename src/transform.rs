//! Transform interpreter.
//!
//! Runs a provision's compiled [`Rule`]s strictly in order against one
//! in-progress response. Each rule resolves its source to a [`TypedValue`],
//! optionally passes it through a filter, and writes it to its target.
//!
//! Rules are best-effort: a source that cannot be resolved, a filter that
//! does not pass or a value that cannot be coerced to the target type skips
//! that single rule. The one exception is `JsonConstraint`, whose failure
//! aborts the whole pipeline.

use crate::command::CommandRunner;
use crate::events::{EventKey, EventStore};
use crate::math::MathEvaluator;
use crate::matching::RequestUri;
use crate::provision::Provision;
use crate::rule::{BodyType, Filter, Rule, SourceKind, TargetKind, TimeUnit};
use crate::value::{remove_pointer, set_pointer, to_pointer, TypedValue};
use crate::variables::{substitute, GlobalVariables, TransactionVars};
use chrono::format::{Item, StrftimeItems};
use chrono::{Local, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

/// Request data visible to the pipeline.
pub struct TransformContext<'a> {
    pub key: &'a EventKey,
    pub uri: &'a RequestUri,
    /// Header names are lowercase.
    pub headers: &'a HashMap<String, String>,
    pub body: &'a [u8],
    pub body_json: Option<&'a Value>,
    pub in_state: &'a str,
    pub recvseq: u64,
}

/// Response being built by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDraft {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// String bodies are sent raw unless some rule wrote into the body.
    pub body_is_json: bool,
    pub delay_ms: u64,
    pub out_state: String,
    /// States requested for other keys through `outState.<METHOD>` targets.
    pub foreign_states: Vec<(EventKey, String)>,
}

impl ResponseDraft {
    pub fn from_provision(provision: &Provision) -> Self {
        Self {
            status: provision.response_code,
            headers: provision.response_headers.clone(),
            body: provision.response_body.clone(),
            body_is_json: matches!(
                provision.response_body,
                Some(Value::Object(_)) | Some(Value::Array(_))
            ),
            delay_ms: provision.response_delay_ms,
            out_state: provision.out_state.clone(),
            foreign_states: Vec::new(),
        }
    }

    /// Serialize the body for the wire.
    pub fn render_body(&self) -> Vec<u8> {
        match &self.body {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(text)) if !self.body_is_json => text.clone().into_bytes(),
            Some(value) => value.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    /// A `JsonConstraint` failed; carries the diagnostic message.
    Aborted(String),
}

enum Resolved {
    Value(TypedValue),
    Eraser,
}

enum Filtered {
    Pass {
        value: TypedValue,
        captures: Vec<String>,
    },
    Skip(&'static str),
    Abort(String),
}

fn pass(value: TypedValue) -> Filtered {
    Filtered::Pass {
        value,
        captures: Vec::new(),
    }
}

#[derive(Clone, Copy)]
enum Arithmetic {
    Sum,
    Multiply,
}

pub struct TransformInterpreter {
    globals: Arc<GlobalVariables>,
    events: Arc<EventStore>,
    commands: Arc<dyn CommandRunner>,
    math: MathEvaluator,
}

impl TransformInterpreter {
    pub fn new(
        globals: Arc<GlobalVariables>,
        events: Arc<EventStore>,
        commands: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            globals,
            events,
            commands,
            math: MathEvaluator::new(),
        }
    }

    /// Execute `rules` in order against `draft`.
    pub async fn run(
        &self,
        rules: &[Rule],
        ctx: &TransformContext<'_>,
        draft: &mut ResponseDraft,
    ) -> PipelineOutcome {
        let mut vars = TransactionVars::new();

        for (index, rule) in rules.iter().enumerate() {
            let Some(resolved) = self.resolve(&rule.source, ctx, draft, &mut vars).await else {
                debug!(rule = index, source = ?rule.source, "Source not resolved, rule skipped");
                continue;
            };

            let (resolved, captures) = match (&rule.filter, resolved) {
                (None, resolved) => (resolved, Vec::new()),
                (Some(_), Resolved::Eraser) => {
                    debug!(rule = index, "Eraser cannot be filtered, rule skipped");
                    continue;
                }
                (Some(filter), Resolved::Value(value)) => {
                    match self.apply_filter(filter, value, &vars) {
                        Filtered::Pass { value, captures } => (Resolved::Value(value), captures),
                        Filtered::Skip(reason) => {
                            debug!(rule = index, reason, "Filter not passed, rule skipped");
                            continue;
                        }
                        Filtered::Abort(message) => {
                            warn!(rule = index, %message, "Transform pipeline aborted");
                            return PipelineOutcome::Aborted(message);
                        }
                    }
                }
            };

            if !self.write(&rule.target, resolved, captures, ctx, draft, &mut vars) {
                debug!(rule = index, target = ?rule.target, "Target not written, rule skipped");
            }
        }

        PipelineOutcome::Completed
    }

    fn substitute(&self, text: &str, vars: &TransactionVars) -> String {
        substitute(text, vars, &self.globals)
    }

    /// Transaction variable first, then global.
    fn variable(&self, name: &str, vars: &TransactionVars) -> Option<String> {
        let name = self.substitute(name, vars);
        vars.get(&name).cloned().or_else(|| self.globals.get(&name))
    }

    async fn resolve(
        &self,
        source: &SourceKind,
        ctx: &TransformContext<'_>,
        draft: &ResponseDraft,
        vars: &mut TransactionVars,
    ) -> Option<Resolved> {
        let value = match source {
            SourceKind::RequestUri => TypedValue::String(ctx.uri.normalized.clone()),
            SourceKind::RequestUriPath => TypedValue::String(ctx.uri.path.clone()),
            SourceKind::RequestUriParam(name) => TypedValue::String(ctx.uri.params.get(name)?.clone()),
            SourceKind::RequestBody(None) => match ctx.body_json {
                Some(document) => TypedValue::from_json(document)?,
                None if ctx.body.is_empty() => return None,
                None => TypedValue::String(String::from_utf8_lossy(ctx.body).into_owned()),
            },
            SourceKind::RequestBody(Some(path)) => {
                let pointer = to_pointer(&self.substitute(path, vars));
                TypedValue::from_json(ctx.body_json?.pointer(&pointer)?)?
            }
            SourceKind::ResponseBody(None) => TypedValue::from_json(draft.body.as_ref()?)?,
            SourceKind::ResponseBody(Some(path)) => {
                let pointer = to_pointer(&self.substitute(path, vars));
                TypedValue::from_json(draft.body.as_ref()?.pointer(&pointer)?)?
            }
            SourceKind::RequestHeader(name) => TypedValue::String(ctx.headers.get(name)?.clone()),
            SourceKind::Eraser => return Some(Resolved::Eraser),
            SourceKind::Random { min, max } => {
                let picked = rand::thread_rng().gen_range(*min..=*max);
                TypedValue::Integer(picked)
            }
            SourceKind::RandomSet(options) => {
                let options = self.substitute(options, vars);
                let items: Vec<&str> = options.split('|').collect();
                let picked = items.choose(&mut rand::thread_rng())?.to_string();
                TypedValue::String(picked)
            }
            SourceKind::Timestamp(unit) => {
                let now = Utc::now();
                TypedValue::Integer(match unit {
                    TimeUnit::Seconds => now.timestamp(),
                    TimeUnit::Millis => now.timestamp_millis(),
                    TimeUnit::Micros => now.timestamp_micros(),
                    TimeUnit::Nanos => now.timestamp_nanos_opt()?,
                })
            }
            SourceKind::Strftime(format) => {
                TypedValue::String(self.substitute(&format_local_time(format)?, vars))
            }
            SourceKind::Recvseq => TypedValue::Unsigned(ctx.recvseq),
            SourceKind::Var(name) => {
                TypedValue::String(vars.get(&self.substitute(name, vars))?.clone())
            }
            SourceKind::GlobalVar(name) => {
                TypedValue::String(self.globals.get(&self.substitute(name, vars))?)
            }
            SourceKind::Value(literal) => TypedValue::String(self.substitute(literal, vars)),
            SourceKind::Event(prefix) => {
                self.replay_event(&self.substitute(prefix, vars), ctx, vars)?
            }
            SourceKind::InState => TypedValue::String(ctx.in_state.to_string()),
            SourceKind::Math(expression) => {
                let expression = self.substitute(expression, vars);
                match self.math.eval(&expression) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(%expression, error = %e, "Math expression failed");
                        return None;
                    }
                }
            }
            SourceKind::Command(command) => {
                let command = self.substitute(command, vars);
                match self.commands.run(&command).await {
                    Ok(output) => {
                        vars.insert("rc".to_string(), output.return_code.to_string());
                        let stdout = output.stdout;
                        TypedValue::String(stdout.strip_suffix('\n').unwrap_or(&stdout).to_string())
                    }
                    Err(e) => {
                        warn!(%command, error = %e, "Command failed");
                        vars.insert("rc".to_string(), "-1".to_string());
                        return None;
                    }
                }
            }
        };
        Some(Resolved::Value(value))
    }

    /// Read a stored event addressed by `<prefix>.method`, `.uri`, `.number`
    /// and `.path` transaction variables. Method and uri default to the
    /// current key, number to the last event.
    fn replay_event(
        &self,
        prefix: &str,
        ctx: &TransformContext<'_>,
        vars: &TransactionVars,
    ) -> Option<TypedValue> {
        let lookup = |suffix: &str| vars.get(&format!("{prefix}.{suffix}")).cloned();

        let method = lookup("method").unwrap_or_else(|| ctx.key.method.clone());
        let uri = lookup("uri").unwrap_or_else(|| ctx.key.uri.clone());
        let number = match lookup("number") {
            Some(number) => number.parse::<i64>().ok()?,
            None => -1,
        };

        let document = self.events.event(&EventKey::new(method, uri), number)?.to_json();
        match lookup("path").filter(|p| !p.is_empty()) {
            Some(path) => TypedValue::from_json(document.pointer(&to_pointer(&path))?),
            None => TypedValue::from_json(&document),
        }
    }

    fn apply_filter(&self, filter: &Filter, value: TypedValue, vars: &TransactionVars) -> Filtered {
        match filter {
            Filter::RegexCapture(regex) => {
                let text = value.as_string();
                let Some(groups) = regex.captures(&text) else {
                    return Filtered::Skip("RegexCapture did not match");
                };
                let captures = groups
                    .iter()
                    .skip(1)
                    .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                    .collect();
                Filtered::Pass {
                    value: TypedValue::String(text),
                    captures,
                }
            }
            Filter::RegexReplace { regex, fmt } => pass(TypedValue::String(
                regex.replace_all(&value.as_string(), fmt.as_str()).into_owned(),
            )),
            Filter::Append(suffix) => pass(TypedValue::String(
                format!("{}{}", value.as_string(), self.substitute(suffix, vars)),
            )),
            Filter::Prepend(prefix) => pass(TypedValue::String(
                format!("{}{}", self.substitute(prefix, vars), value.as_string()),
            )),
            Filter::AppendVar(name) => match self.variable(name, vars) {
                Some(suffix) => pass(TypedValue::String(format!("{}{suffix}", value.as_string()))),
                None => Filtered::Skip("AppendVar variable not found"),
            },
            Filter::PrependVar(name) => match self.variable(name, vars) {
                Some(prefix) => pass(TypedValue::String(format!("{prefix}{}", value.as_string()))),
                None => Filtered::Skip("PrependVar variable not found"),
            },
            Filter::Sum(operand) => arithmetic(&value, operand, Arithmetic::Sum)
                .map_or(Filtered::Skip("Sum not applicable"), pass),
            Filter::Multiply(operand) => arithmetic(&value, operand, Arithmetic::Multiply)
                .map_or(Filtered::Skip("Multiply not applicable"), pass),
            Filter::ConditionVar { name, negated } => {
                let set = self.variable(name, vars).is_some_and(|v| !v.is_empty());
                if set != *negated {
                    pass(value)
                } else {
                    Filtered::Skip("ConditionVar not satisfied")
                }
            }
            Filter::EqualTo(expected) => {
                if value.as_string() == self.substitute(expected, vars) {
                    pass(value)
                } else {
                    Filtered::Skip("EqualTo not satisfied")
                }
            }
            Filter::DifferentFrom(expected) => {
                if value.as_string() != self.substitute(expected, vars) {
                    pass(value)
                } else {
                    Filtered::Skip("DifferentFrom not satisfied")
                }
            }
            Filter::JsonConstraint(constraint) => match json_contains(&value.to_json(), constraint, "") {
                Ok(()) => pass(value),
                Err(reason) => Filtered::Abort(format!("JsonConstraint FAILED: {reason}")),
            },
        }
    }

    fn write(
        &self,
        target: &TargetKind,
        resolved: Resolved,
        captures: Vec<String>,
        ctx: &TransformContext<'_>,
        draft: &mut ResponseDraft,
        vars: &mut TransactionVars,
    ) -> bool {
        let value = match resolved {
            Resolved::Eraser => return self.erase(target, draft, vars),
            Resolved::Value(value) => value,
        };

        match target {
            TargetKind::ResponseBody { kind, path } => {
                let Some(node) = convert_body(*kind, &value) else {
                    return false;
                };
                match path {
                    None => draft.body = Some(node),
                    Some(path) => {
                        let pointer = to_pointer(&self.substitute(path, vars));
                        let body = draft.body.get_or_insert(Value::Null);
                        if !(body.is_object() || body.is_array()) {
                            *body = Value::Object(Map::new());
                        }
                        if !set_pointer(body, &pointer, node) {
                            return false;
                        }
                    }
                }
                draft.body_is_json = true;
                true
            }
            TargetKind::ResponseHeader(name) => {
                draft.headers.insert(name.clone(), value.as_string());
                true
            }
            TargetKind::ResponseStatusCode => {
                match value
                    .as_unsigned()
                    .and_then(|code| u16::try_from(code).ok())
                    .filter(|code| (100..=599).contains(code))
                {
                    Some(code) => {
                        draft.status = code;
                        true
                    }
                    None => false,
                }
            }
            TargetKind::ResponseDelayMs => match value.as_unsigned() {
                Some(delay) => {
                    draft.delay_ms = delay;
                    true
                }
                None => false,
            },
            TargetKind::Var(name) => {
                let name = self.substitute(name, vars);
                for (index, capture) in captures.into_iter().enumerate() {
                    vars.insert(format!("{name}.{}", index + 1), capture);
                }
                vars.insert(name, value.as_string());
                true
            }
            TargetKind::GlobalVar(name) => {
                let name = self.substitute(name, vars);
                for (index, capture) in captures.into_iter().enumerate() {
                    self.globals.set(format!("{name}.{}", index + 1), capture);
                }
                self.globals.set(name, value.as_string());
                true
            }
            TargetKind::OutState => {
                draft.out_state = value.as_string();
                true
            }
            TargetKind::ForeignOutState { method, uri } => {
                let uri = match uri {
                    Some(uri) => self.substitute(uri, vars),
                    None => ctx.key.uri.clone(),
                };
                draft
                    .foreign_states
                    .push((EventKey::new(method.as_str(), uri), value.as_string()));
                true
            }
        }
    }

    fn erase(&self, target: &TargetKind, draft: &mut ResponseDraft, vars: &mut TransactionVars) -> bool {
        match target {
            TargetKind::ResponseBody {
                kind: BodyType::Object,
                path: None,
            } => {
                draft.body = None;
                true
            }
            TargetKind::ResponseBody {
                kind: BodyType::Object,
                path: Some(path),
            } => {
                let pointer = to_pointer(&self.substitute(path, vars));
                draft
                    .body
                    .as_mut()
                    .is_some_and(|body| remove_pointer(body, &pointer))
            }
            TargetKind::ResponseHeader(name) => draft.headers.remove(name).is_some(),
            TargetKind::Var(name) => {
                let name = self.substitute(name, vars);
                vars.remove(&name).is_some()
            }
            TargetKind::GlobalVar(name) => self.globals.remove(&self.substitute(name, vars)),
            _ => false,
        }
    }
}

fn convert_body(kind: BodyType, value: &TypedValue) -> Option<Value> {
    match kind {
        BodyType::String => Some(Value::String(value.as_string())),
        BodyType::Integer => value.as_integer().map(Value::from),
        BodyType::Unsigned => value.as_unsigned().map(Value::from),
        BodyType::Float => value.as_float().and_then(Number::from_f64).map(Value::Number),
        BodyType::Boolean => value.as_boolean().map(Value::Bool),
        BodyType::Object => Some(value.to_json()),
        BodyType::JsonString => serde_json::from_str(&value.as_string()).ok(),
    }
}

/// Integer arithmetic while both sides are integers, float otherwise.
fn arithmetic(value: &TypedValue, operand: &Number, op: Arithmetic) -> Option<TypedValue> {
    if !matches!(value, TypedValue::Float(_)) {
        if let (Some(a), Some(b)) = (value.as_integer(), operand.as_i64()) {
            let result = match op {
                Arithmetic::Sum => a.checked_add(b),
                Arithmetic::Multiply => a.checked_mul(b),
            }?;
            return Some(match value {
                TypedValue::Unsigned(_) if result >= 0 => TypedValue::Unsigned(result as u64),
                _ => TypedValue::Integer(result),
            });
        }
    }

    let a = value.as_float()?;
    let b = operand.as_f64()?;
    Some(TypedValue::Float(match op {
        Arithmetic::Sum => a + b,
        Arithmetic::Multiply => a * b,
    }))
}

/// Every member of `expected` must be present in `actual` with an equal value.
fn json_contains(actual: &Value, expected: &Value, path: &str) -> Result<(), String> {
    match expected {
        Value::Object(members) => {
            let Some(object) = actual.as_object() else {
                let at = if path.is_empty() { "/" } else { path };
                return Err(format!("expected an object at '{at}'"));
            };
            for (key, expected_member) in members {
                let member_path = format!("{path}/{key}");
                match object.get(key) {
                    Some(actual_member) => json_contains(actual_member, expected_member, &member_path)?,
                    None => return Err(format!("missing key '{member_path}'")),
                }
            }
            Ok(())
        }
        other if other == actual => Ok(()),
        other => Err(format!(
            "value mismatch at '{path}': expected {other}, got {actual}"
        )),
    }
}

/// Current local time with a strftime format. Invalid formats yield `None`.
fn format_local_time(format: &str) -> Option<String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return None;
    }
    let mut out = String::new();
    write!(out, "{}", Local::now().format_with_items(items.iter())).ok()?;
    Some(out)
}
