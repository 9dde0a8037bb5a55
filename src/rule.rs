//! Transform rules.
//!
//! A provision carries `transform` items of the form
//! `{source, target, filter?}`. Each item is compiled once, when the provision
//! is loaded, into a [`Rule`] whose source, target and filter are typed
//! variants. The interpreter never looks at the original strings again.

use crate::error::RuleError;
use crate::provision::HttpMethod;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Transform item as received in a provision document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterDefinition>,
}

/// Filter item as received in a provision document: an object with exactly one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum FilterDefinition {
    RegexCapture(String),
    RegexReplace { rgx: String, fmt: String },
    Append(String),
    Prepend(String),
    AppendVar(String),
    PrependVar(String),
    Sum(Number),
    Multiply(Number),
    ConditionVar(String),
    EqualTo(String),
    DifferentFrom(String),
    JsonConstraint(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

/// Where a rule reads its value from.
///
/// Strings holding names or literals are kept raw because they may contain
/// `@{var}` tokens that are only resolvable per request.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    RequestUri,
    RequestUriPath,
    RequestUriParam(String),
    RequestBody(Option<String>),
    RequestHeader(String),
    ResponseBody(Option<String>),
    Eraser,
    Random { min: i64, max: i64 },
    RandomSet(String),
    Timestamp(TimeUnit),
    Strftime(String),
    Recvseq,
    Var(String),
    GlobalVar(String),
    Value(String),
    Event(String),
    InState,
    Math(String),
    Command(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    String,
    Integer,
    Unsigned,
    Float,
    Boolean,
    Object,
    JsonString,
}

/// Where a rule writes its value to.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetKind {
    ResponseBody { kind: BodyType, path: Option<String> },
    ResponseHeader(String),
    ResponseStatusCode,
    ResponseDelayMs,
    Var(String),
    GlobalVar(String),
    OutState,
    /// State of the key with the same uri (or the given one) under another method.
    ForeignOutState { method: HttpMethod, uri: Option<String> },
}

#[derive(Debug, Clone)]
pub enum Filter {
    RegexCapture(Regex),
    RegexReplace { regex: Regex, fmt: String },
    Append(String),
    Prepend(String),
    AppendVar(String),
    PrependVar(String),
    Sum(Number),
    Multiply(Number),
    ConditionVar { name: String, negated: bool },
    EqualTo(String),
    DifferentFrom(String),
    JsonConstraint(Value),
}

/// A compiled transform item.
#[derive(Debug, Clone)]
pub struct Rule {
    pub source: SourceKind,
    pub target: TargetKind,
    pub filter: Option<Filter>,
}

impl Rule {
    pub fn compile(definition: &RuleDefinition) -> Result<Self, RuleError> {
        Ok(Self {
            source: SourceKind::parse(&definition.source)?,
            target: TargetKind::parse(&definition.target)?,
            filter: definition.filter.as_ref().map(Filter::compile).transpose()?,
        })
    }
}

fn non_empty<'a>(
    rest: &'a str,
    text: &str,
    err: fn(String) -> RuleError,
) -> Result<&'a str, RuleError> {
    if rest.is_empty() {
        Err(err(text.to_string()))
    } else {
        Ok(rest)
    }
}

/// Legacy spelling of the generic sources.
fn strip_general(text: &str) -> &str {
    text.strip_prefix("general.").unwrap_or(text)
}

impl SourceKind {
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let unknown = RuleError::UnknownSource;
        let general = strip_general(text);

        match text {
            "request.uri" => return Ok(Self::RequestUri),
            "request.uri.path" => return Ok(Self::RequestUriPath),
            "request.body" => return Ok(Self::RequestBody(None)),
            "response.body" => return Ok(Self::ResponseBody(None)),
            "eraser" => return Ok(Self::Eraser),
            "inState" => return Ok(Self::InState),
            _ => {}
        }
        if general == "recvseq" {
            return Ok(Self::Recvseq);
        }

        if let Some(rest) = text.strip_prefix("request.uri.param.") {
            return Ok(Self::RequestUriParam(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = text.strip_prefix("request.body.") {
            return Ok(Self::RequestBody(Some(non_empty(rest, text, unknown)?.to_string())));
        }
        if let Some(rest) = text.strip_prefix("request.header.") {
            return Ok(Self::RequestHeader(
                non_empty(rest, text, unknown)?.to_ascii_lowercase(),
            ));
        }
        if let Some(rest) = text.strip_prefix("response.body.") {
            return Ok(Self::ResponseBody(Some(non_empty(rest, text, unknown)?.to_string())));
        }
        if let Some(rest) = general.strip_prefix("randomset.") {
            return Ok(Self::RandomSet(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = general.strip_prefix("random.") {
            let (min, max) = rest
                .split_once('.')
                .ok_or_else(|| RuleError::data("random range", rest, "expected <min>.<max>"))?;
            let min: i64 = min
                .parse()
                .map_err(|_| RuleError::data("random range", rest, "min is not an integer"))?;
            let max: i64 = max
                .parse()
                .map_err(|_| RuleError::data("random range", rest, "max is not an integer"))?;
            if min > max {
                return Err(RuleError::data("random range", rest, "min is greater than max"));
            }
            return Ok(Self::Random { min, max });
        }
        if let Some(rest) = general.strip_prefix("timestamp.") {
            let unit = match rest {
                "s" => TimeUnit::Seconds,
                "ms" => TimeUnit::Millis,
                "us" => TimeUnit::Micros,
                "ns" => TimeUnit::Nanos,
                _ => return Err(unknown(text.to_string())),
            };
            return Ok(Self::Timestamp(unit));
        }
        if let Some(rest) = general.strip_prefix("strftime.") {
            return Ok(Self::Strftime(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = text.strip_prefix("var.") {
            return Ok(Self::Var(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = text.strip_prefix("globalVar.") {
            return Ok(Self::GlobalVar(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = text.strip_prefix("value.") {
            return Ok(Self::Value(rest.to_string()));
        }
        if let Some(rest) = text.strip_prefix("event.") {
            return Ok(Self::Event(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = text.strip_prefix("math.") {
            return Ok(Self::Math(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = text.strip_prefix("command.") {
            return Ok(Self::Command(non_empty(rest, text, unknown)?.to_string()));
        }

        Err(unknown(text.to_string()))
    }
}

impl BodyType {
    fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "string" => Self::String,
            "integer" => Self::Integer,
            "unsigned" => Self::Unsigned,
            "float" => Self::Float,
            "boolean" => Self::Boolean,
            "object" => Self::Object,
            "jsonstring" => Self::JsonString,
            _ => return None,
        })
    }
}

impl TargetKind {
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let unknown = RuleError::UnknownTarget;

        match text {
            "response.statusCode" => return Ok(Self::ResponseStatusCode),
            "response.delayMs" => return Ok(Self::ResponseDelayMs),
            "outState" => return Ok(Self::OutState),
            _ => {}
        }

        if let Some(rest) = text.strip_prefix("response.body.") {
            let (kind, path) = match rest.split_once('.') {
                Some((kind, path)) => (kind, Some(non_empty(path, text, unknown)?.to_string())),
                None => (rest, None),
            };
            let kind = BodyType::parse(kind).ok_or_else(|| unknown(text.to_string()))?;
            return Ok(Self::ResponseBody { kind, path });
        }
        if let Some(rest) = text.strip_prefix("response.header.") {
            return Ok(Self::ResponseHeader(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = text.strip_prefix("var.") {
            return Ok(Self::Var(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = text.strip_prefix("globalVar.") {
            return Ok(Self::GlobalVar(non_empty(rest, text, unknown)?.to_string()));
        }
        if let Some(rest) = text.strip_prefix("outState.") {
            let (method, uri) = match rest.split_once('.') {
                Some((method, uri)) => (method, Some(non_empty(uri, text, unknown)?.to_string())),
                None => (rest, None),
            };
            let method = method
                .parse::<HttpMethod>()
                .map_err(|_| unknown(text.to_string()))?;
            return Ok(Self::ForeignOutState { method, uri });
        }

        Err(unknown(text.to_string()))
    }
}

impl Filter {
    pub fn compile(definition: &FilterDefinition) -> Result<Self, RuleError> {
        Ok(match definition {
            FilterDefinition::RegexCapture(rgx) => {
                // Captures require the whole value to match.
                let regex = Regex::new(&format!("^(?:{rgx})$"))
                    .map_err(|e| RuleError::data("RegexCapture", rgx, e.to_string()))?;
                Self::RegexCapture(regex)
            }
            FilterDefinition::RegexReplace { rgx, fmt } => Self::RegexReplace {
                regex: Regex::new(rgx)
                    .map_err(|e| RuleError::data("RegexReplace", rgx, e.to_string()))?,
                fmt: fmt.clone(),
            },
            FilterDefinition::Append(s) => Self::Append(s.clone()),
            FilterDefinition::Prepend(s) => Self::Prepend(s.clone()),
            FilterDefinition::AppendVar(s) => Self::AppendVar(s.clone()),
            FilterDefinition::PrependVar(s) => Self::PrependVar(s.clone()),
            FilterDefinition::Sum(n) => Self::Sum(n.clone()),
            FilterDefinition::Multiply(n) => Self::Multiply(n.clone()),
            FilterDefinition::ConditionVar(name) => {
                let (name, negated) = match name.strip_prefix('!') {
                    Some(rest) => (rest, true),
                    None => (name.as_str(), false),
                };
                if name.is_empty() {
                    return Err(RuleError::data("ConditionVar", name, "empty variable name"));
                }
                Self::ConditionVar {
                    name: name.to_string(),
                    negated,
                }
            }
            FilterDefinition::EqualTo(s) => Self::EqualTo(s.clone()),
            FilterDefinition::DifferentFrom(s) => Self::DifferentFrom(s.clone()),
            FilterDefinition::JsonConstraint(doc) => {
                if !doc.is_object() {
                    return Err(RuleError::data(
                        "JsonConstraint",
                        &doc.to_string(),
                        "constraint must be an object",
                    ));
                }
                Self::JsonConstraint(doc.clone())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(value: Value) -> Result<Rule, RuleError> {
        let definition: RuleDefinition = serde_json::from_value(value).unwrap();
        Rule::compile(&definition)
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!(SourceKind::parse("request.uri").unwrap(), SourceKind::RequestUri);
        assert_eq!(
            SourceKind::parse("request.body.node1.node2").unwrap(),
            SourceKind::RequestBody(Some("node1.node2".into()))
        );
        assert_eq!(
            SourceKind::parse("request.header.Content-Type").unwrap(),
            SourceKind::RequestHeader("content-type".into())
        );
        assert_eq!(
            SourceKind::parse("random.-5.5").unwrap(),
            SourceKind::Random { min: -5, max: 5 }
        );
        assert_eq!(
            SourceKind::parse("general.recvseq").unwrap(),
            SourceKind::Recvseq
        );
        assert_eq!(
            SourceKind::parse("general.timestamp.ns").unwrap(),
            SourceKind::Timestamp(TimeUnit::Nanos)
        );
        assert_eq!(
            SourceKind::parse("randomset.a|b|c").unwrap(),
            SourceKind::RandomSet("a|b|c".into())
        );
        assert_eq!(
            SourceKind::parse("value.").unwrap(),
            SourceKind::Value(String::new())
        );
        assert_eq!(
            SourceKind::parse("math.1+2").unwrap(),
            SourceKind::Math("1+2".into())
        );
    }

    #[test]
    fn test_parse_source_errors() {
        assert!(SourceKind::parse("request.nothing").unwrap_err().is_schema());
        assert!(SourceKind::parse("var.").unwrap_err().is_schema());
        assert!(SourceKind::parse("timestamp.h").unwrap_err().is_schema());
        assert!(!SourceKind::parse("random.9.1").unwrap_err().is_schema());
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            TargetKind::parse("response.body.float.x").unwrap(),
            TargetKind::ResponseBody {
                kind: BodyType::Float,
                path: Some("x".into())
            }
        );
        assert_eq!(
            TargetKind::parse("response.body.string./a/b").unwrap(),
            TargetKind::ResponseBody {
                kind: BodyType::String,
                path: Some("/a/b".into())
            }
        );
        assert_eq!(
            TargetKind::parse("response.body.object").unwrap(),
            TargetKind::ResponseBody {
                kind: BodyType::Object,
                path: None
            }
        );
        assert_eq!(
            TargetKind::parse("outState.GET./app/v1/item").unwrap(),
            TargetKind::ForeignOutState {
                method: HttpMethod::Get,
                uri: Some("/app/v1/item".into())
            }
        );
        assert!(TargetKind::parse("response.body.decimal.x").is_err());
        assert!(TargetKind::parse("outState.PATCH").is_err());
    }

    #[test]
    fn test_compile_with_filters() {
        let rule = compile(json!({
            "source": "request.uri.path",
            "target": "var.id",
            "filter": {"RegexCapture": "/app/v1/(\\w+)"}
        }))
        .unwrap();
        assert!(matches!(rule.filter, Some(Filter::RegexCapture(_))));

        let rule = compile(json!({
            "source": "var.id",
            "target": "var.flag",
            "filter": {"ConditionVar": "!missing"}
        }))
        .unwrap();
        match rule.filter {
            Some(Filter::ConditionVar { name, negated }) => {
                assert_eq!(name, "missing");
                assert!(negated);
            }
            other => panic!("unexpected filter {other:?}"),
        }
    }

    #[test]
    fn test_bad_regex_is_data_error() {
        let err = compile(json!({
            "source": "request.uri",
            "target": "var.x",
            "filter": {"RegexReplace": {"rgx": "(", "fmt": "x"}}
        }))
        .unwrap_err();
        assert!(!err.is_schema());
    }

    #[test]
    fn test_filter_requires_single_key() {
        let parsed: Result<RuleDefinition, _> = serde_json::from_value(json!({
            "source": "request.uri",
            "target": "var.x",
            "filter": {"Append": "a", "Prepend": "b"}
        }));
        assert!(parsed.is_err());
    }
}
