//! Matching configuration and request URI classification.
//!
//! The active [`MatchingConfig`] decides which URI a request is classified
//! under when looking up provisions:
//!
//! - `FullMatching`: the URI after query parameter filtering must equal the
//!   provision's `requestUri`.
//! - `FullMatchingRegexReplace`: like `FullMatching`, after rewriting the URI
//!   with `rgx` / `fmt` (`$1`, `$2`, ... capture references).
//! - `RegexMatching` / `PriorityMatchingRegex`: each provision's `requestUri`
//!   is a regular expression, tried in registration order.

use crate::error::PayloadError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    FullMatching,
    FullMatchingRegexReplace,
    RegexMatching,
    PriorityMatchingRegex,
}

/// How query parameters take part in classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryParamsFilter {
    /// Parameters sorted by name.
    Sort,
    /// Raw query string as received.
    PassBy,
    /// Parameters dropped.
    #[default]
    #[serde(alias = "Strip")]
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuerySeparator {
    #[default]
    Ampersand,
    Semicolon,
}

impl QuerySeparator {
    pub fn as_char(self) -> char {
        match self {
            Self::Ampersand => '&',
            Self::Semicolon => ';',
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryParamsDefinition {
    filter: QueryParamsFilter,
    #[serde(default)]
    separator: QuerySeparator,
}

/// Matching document as received by the admin API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MatchingDefinition {
    algorithm: Algorithm,
    #[serde(default)]
    rgx: Option<String>,
    #[serde(default)]
    fmt: Option<String>,
    #[serde(default)]
    uri_path_query_parameters: Option<QueryParamsDefinition>,
    #[serde(default)]
    uri_path_query_parameters_filter: Option<QueryParamsFilter>,
}

/// Active matching configuration.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    algorithm: Algorithm,
    replace: Option<(Regex, String)>,
    query_filter: QueryParamsFilter,
    separator: QuerySeparator,
    document: Value,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::FullMatching,
            replace: None,
            query_filter: QueryParamsFilter::default(),
            separator: QuerySeparator::default(),
            document: json!({"algorithm": "FullMatching"}),
        }
    }
}

impl MatchingConfig {
    /// Parse and check an admin matching document.
    pub fn from_json(document: &Value) -> Result<Self, PayloadError> {
        let definition: MatchingDefinition = serde_json::from_value(document.clone())?;

        let replace = match (definition.algorithm, &definition.rgx, &definition.fmt) {
            (Algorithm::FullMatchingRegexReplace, Some(rgx), Some(fmt)) => {
                let regex = Regex::new(rgx).map_err(|e| PayloadError::Data(e.to_string()))?;
                Some((regex, fmt.clone()))
            }
            (Algorithm::FullMatchingRegexReplace, _, _) => {
                return Err(PayloadError::Data(
                    "FullMatchingRegexReplace requires both rgx and fmt".to_string(),
                ))
            }
            (_, None, None) => None,
            (algorithm, _, _) => {
                return Err(PayloadError::Data(format!(
                    "{algorithm:?} does not accept rgx or fmt"
                )))
            }
        };

        let (query_filter, separator) = match (
            definition.uri_path_query_parameters,
            definition.uri_path_query_parameters_filter,
        ) {
            (Some(_), Some(_)) => {
                return Err(PayloadError::Data(
                    "uriPathQueryParameters and uriPathQueryParametersFilter are exclusive"
                        .to_string(),
                ))
            }
            (Some(params), None) => (params.filter, params.separator),
            (None, Some(filter)) => (filter, QuerySeparator::default()),
            (None, None) => (QueryParamsFilter::default(), QuerySeparator::default()),
        };

        Ok(Self {
            algorithm: definition.algorithm,
            replace,
            query_filter,
            separator,
            document: document.clone(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The document this configuration was built from.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Whether provision URIs are regular expressions.
    pub fn uses_regex_uris(&self) -> bool {
        matches!(
            self.algorithm,
            Algorithm::RegexMatching | Algorithm::PriorityMatchingRegex
        )
    }

    /// Split a request target into its classification and key URIs.
    pub fn classify(&self, path: &str, query: Option<&str>) -> RequestUri {
        let query = query.filter(|q| !q.is_empty());
        let params = query
            .map(|q| parse_query(q, self.separator.as_char()))
            .unwrap_or_default();
        let normalized = join_uri(path, &encode_sorted(&params, '&'));

        let filtered = match self.query_filter {
            QueryParamsFilter::Ignore => path.to_string(),
            QueryParamsFilter::PassBy => join_uri(path, query.unwrap_or_default()),
            QueryParamsFilter::Sort => {
                join_uri(path, &encode_sorted(&params, self.separator.as_char()))
            }
        };
        let classification = match &self.replace {
            Some((regex, fmt)) => regex.replace(&filtered, fmt.as_str()).into_owned(),
            None => filtered,
        };

        RequestUri {
            path: path.to_string(),
            params,
            normalized,
            classification,
        }
    }
}

/// A classified request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUri {
    /// Path without query.
    pub path: String,
    /// Decoded query parameters.
    pub params: BTreeMap<String, String>,
    /// Path plus parameters sorted by name. Used as the event/state key.
    pub normalized: String,
    /// URI used to look up provisions.
    pub classification: String,
}

fn join_uri(path: &str, query: &str) -> String {
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    }
}

fn encode_sorted(params: &BTreeMap<String, String>, separator: char) -> String {
    params
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                urlencoding::encode(k).into_owned()
            } else {
                format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
            }
        })
        .collect::<Vec<_>>()
        .join(&separator.to_string())
}

fn decode(s: &str) -> String {
    let spaced = s.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|d| d.into_owned())
        .unwrap_or(spaced)
}

/// Parse a query string. The first occurrence of a repeated name wins.
pub fn parse_query(query: &str, separator: char) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();

    for part in query.split(separator) {
        if part.is_empty() {
            continue;
        }
        let (key, value) = match part.split_once('=') {
            Some((key, value)) => (decode(key), decode(value)),
            None => (decode(part), String::new()),
        };
        params.entry(key).or_insert(value);
    }

    params
}
