//! Provision store.
//!
//! Provisions and the matching configuration live together in one immutable
//! [`ProvisionSet`]. Admin operations build a new set and swap it in under a
//! write lock; traffic takes an `Arc` snapshot, so a request always sees a
//! complete old or complete new configuration.

use crate::error::PayloadError;
use crate::matching::MatchingConfig;
use crate::rule::{Rule, RuleDefinition};
use crate::state::INITIAL_STATE;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Methods a provision can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Get,
    Put,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "POST" => Ok(Self::Post),
            "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            other => Err(format!("unsupported method '{other}'")),
        }
    }
}

/// Provision document as received by the admin API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProvisionDefinition {
    request_method: HttpMethod,
    #[serde(default)]
    request_uri: String,
    #[serde(default)]
    request_schema_id: Option<String>,
    #[serde(default)]
    response_schema_id: Option<String>,
    response_code: u16,
    #[serde(default)]
    response_headers: BTreeMap<String, String>,
    #[serde(default)]
    response_body: Option<Value>,
    #[serde(default)]
    response_delay_ms: u64,
    #[serde(default)]
    in_state: Option<String>,
    #[serde(default)]
    out_state: Option<String>,
    #[serde(default)]
    transform: Vec<RuleDefinition>,
}

fn state_or_initial(state: Option<String>) -> String {
    state
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| INITIAL_STATE.to_string())
}

/// A compiled provision.
#[derive(Debug, Clone)]
pub struct Provision {
    pub method: HttpMethod,
    pub uri: String,
    /// `uri` compiled as an anchored regex, when it is one.
    pub uri_regex: Option<Regex>,
    pub request_schema_id: Option<String>,
    pub response_schema_id: Option<String>,
    pub response_code: u16,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<Value>,
    pub response_delay_ms: u64,
    pub in_state: String,
    pub out_state: String,
    pub rules: Vec<Rule>,
    document: Value,
}

impl Provision {
    /// Compile a provision document. `regex_uris` requires `requestUri` to be
    /// a valid regular expression.
    pub fn from_json(document: &Value, regex_uris: bool) -> Result<Self, PayloadError> {
        let definition: ProvisionDefinition = serde_json::from_value(document.clone())?;

        if !(100..=599).contains(&definition.response_code) {
            return Err(PayloadError::Data(format!(
                "responseCode {} out of range",
                definition.response_code
            )));
        }

        let uri_regex = match Regex::new(&format!("^(?:{})$", definition.request_uri)) {
            Ok(regex) => Some(regex),
            Err(e) if regex_uris => {
                return Err(PayloadError::Data(format!(
                    "requestUri is not a valid regular expression: {e}"
                )))
            }
            Err(_) => None,
        };

        let rules = definition
            .transform
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            method: definition.request_method,
            uri: definition.request_uri,
            uri_regex,
            request_schema_id: definition.request_schema_id,
            response_schema_id: definition.response_schema_id,
            response_code: definition.response_code,
            response_headers: definition.response_headers,
            response_body: definition.response_body,
            response_delay_ms: definition.response_delay_ms,
            in_state: state_or_initial(definition.in_state),
            out_state: state_or_initial(definition.out_state),
            rules,
            document: document.clone(),
        })
    }

    /// The document this provision was built from.
    pub fn document(&self) -> &Value {
        &self.document
    }

    fn same_identity(&self, other: &Provision) -> bool {
        self.method == other.method && self.uri == other.uri && self.in_state == other.in_state
    }

    fn is_for(&self, filter: &ProvisionFilter) -> bool {
        self.method == filter.method && self.uri == filter.uri
    }
}

/// Compile a single provision document or an array of them.
///
/// Nothing is returned unless every element compiles.
pub fn parse_batch(document: &Value, regex_uris: bool) -> Result<Vec<Provision>, PayloadError> {
    match document {
        Value::Array(items) => items
            .iter()
            .map(|item| Provision::from_json(item, regex_uris))
            .collect(),
        other => Ok(vec![Provision::from_json(other, regex_uris)?]),
    }
}

/// Selects provisions by method and uri, any state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionFilter {
    pub method: HttpMethod,
    pub uri: String,
}

/// Immutable snapshot of the provisioning configuration.
#[derive(Debug, Clone, Default)]
pub struct ProvisionSet {
    matching: MatchingConfig,
    provisions: Vec<Arc<Provision>>,
}

impl ProvisionSet {
    pub fn matching(&self) -> &MatchingConfig {
        &self.matching
    }

    pub fn len(&self) -> usize {
        self.provisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.provisions.is_empty()
    }

    /// Find the provision for a classified request in the given key state.
    ///
    /// When nothing matches the uri, a provision with an empty `requestUri`
    /// for the same method and state acts as the default.
    pub fn find(&self, method: &str, uri: &str, state: &str) -> Option<Arc<Provision>> {
        let eligible = |p: &&Arc<Provision>| p.method.as_str() == method && p.in_state == state;
        let mut candidates = self.provisions.iter().filter(eligible);

        let found = if self.matching.uses_regex_uris() {
            candidates.find(|p| p.uri_regex.as_ref().is_some_and(|r| r.is_match(uri)))
        } else {
            candidates.find(|p| p.uri == uri)
        };

        found
            .or_else(|| {
                self.provisions
                    .iter()
                    .filter(eligible)
                    .find(|p| p.uri.is_empty())
            })
            .cloned()
    }

    /// Add provisions; one with the identity (method, uri, inState) of an
    /// existing provision replaces it in place.
    fn merge(&mut self, batch: Vec<Provision>) {
        for provision in batch {
            match self.provisions.iter().position(|p| p.same_identity(&provision)) {
                Some(index) => self.provisions[index] = Arc::new(provision),
                None => self.provisions.push(Arc::new(provision)),
            }
        }
    }
}

pub struct ProvisionStore {
    current: RwLock<Arc<ProvisionSet>>,
}

impl ProvisionStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(ProvisionSet::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<ProvisionSet> {
        Arc::clone(&self.current.read())
    }

    /// Switch the matching configuration.
    ///
    /// Switching between exact and regex uris recompiles every loaded
    /// provision; if any of them does not compile nothing changes.
    pub fn set_matching(&self, matching: MatchingConfig) -> Result<(), PayloadError> {
        let mut current = self.current.write();
        let regex_uris = matching.uses_regex_uris();
        let provisions = if regex_uris == current.matching.uses_regex_uris() {
            current.provisions.clone()
        } else {
            current
                .provisions
                .iter()
                .map(|p| Provision::from_json(p.document(), regex_uris).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?
        };
        info!(algorithm = ?matching.algorithm(), "Matching configuration updated");
        *current = Arc::new(ProvisionSet {
            matching,
            provisions,
        });
        Ok(())
    }

    /// Load one provision document or an array of them, all or nothing.
    ///
    /// With `replace_all` the loaded batch becomes the whole provision list.
    pub fn load(&self, document: &Value, replace_all: bool) -> Result<usize, PayloadError> {
        let mut current = self.current.write();
        let batch = parse_batch(document, current.matching.uses_regex_uris())?;
        let count = batch.len();

        let mut next = ProvisionSet::clone(&current);
        if replace_all {
            next.provisions.clear();
        }
        next.merge(batch);
        info!(loaded = count, total = next.provisions.len(), replace_all, "Provisions loaded");
        *current = Arc::new(next);
        Ok(count)
    }

    /// Provision documents in registration order.
    pub fn list(&self, filter: Option<&ProvisionFilter>) -> Vec<Value> {
        self.snapshot()
            .provisions
            .iter()
            .filter(|p| filter.map_or(true, |f| p.is_for(f)))
            .map(|p| p.document().clone())
            .collect()
    }

    /// Remove provisions, returning how many were removed.
    pub fn delete(&self, filter: Option<&ProvisionFilter>) -> usize {
        let mut current = self.current.write();
        let mut next = ProvisionSet::clone(&current);
        let before = next.provisions.len();
        next.provisions
            .retain(|p| !filter.map_or(true, |f| p.is_for(f)));
        let removed = before - next.provisions.len();
        *current = Arc::new(next);
        removed
    }
}

impl Default for ProvisionStore {
    fn default() -> Self {
        Self::new()
    }
}
