use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const BOOTSTRAP_VERB: &str = "workspace.bootstrap";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerbError {
    #[error("verb must look like <kind>.<operation>: {0}")]
    Malformed(String),
    #[error("unknown operation {operation:?} in verb {verb}")]
    UnknownOperation { verb: String, operation: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Get,
    List,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Create,
        Operation::Update,
        Operation::Delete,
        Operation::Get,
        Operation::List,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Get => "get",
            Operation::List => "list",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            "get" => Some(Operation::Get),
            "list" => Some(Operation::List),
            _ => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Update | Operation::Delete
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of an action, carried on the wire as `"<kind>.<operation>"`.
///
/// The kind is not checked against any descriptor list here; that is the
/// dispatcher's job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Verb {
    Resource { kind: String, operation: Operation },
    Bootstrap,
}

impl Verb {
    pub fn resource(kind: impl Into<String>, operation: Operation) -> Self {
        Verb::Resource {
            kind: kind.into(),
            operation,
        }
    }

    pub fn parse(value: &str) -> Result<Self, VerbError> {
        if value == BOOTSTRAP_VERB {
            return Ok(Verb::Bootstrap);
        }
        let Some((kind, operation)) = value.split_once('.') else {
            return Err(VerbError::Malformed(value.to_string()));
        };
        if kind.is_empty() || operation.contains('.') {
            return Err(VerbError::Malformed(value.to_string()));
        }
        let operation = Operation::parse(operation).ok_or_else(|| VerbError::UnknownOperation {
            verb: value.to_string(),
            operation: operation.to_string(),
        })?;
        Ok(Verb::resource(kind, operation))
    }

    pub fn kind(&self) -> Option<&str> {
        match self {
            Verb::Resource { kind, .. } => Some(kind),
            Verb::Bootstrap => None,
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        match self {
            Verb::Resource { operation, .. } => Some(*operation),
            Verb::Bootstrap => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Resource { kind, operation } => write!(f, "{kind}.{operation}"),
            Verb::Bootstrap => f.write_str(BOOTSTRAP_VERB),
        }
    }
}

impl TryFrom<String> for Verb {
    type Error = VerbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Verb::parse(&value)
    }
}

impl From<Verb> for String {
    fn from(value: Verb) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_cache: Option<bool>,
}

impl ActionOptions {
    pub fn skips_cache(&self) -> bool {
        self.skip_cache.unwrap_or(false)
    }

    pub fn allows_optimistic(&self) -> bool {
        self.optimistic.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub verb: Verb,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ActionOptions>,
}

impl Action {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            resource_id: None,
            parent_id: None,
            payload: None,
            options: None,
        }
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn with_parent_id(mut self, id: impl Into<String>) -> Self {
        self.parent_id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_options(mut self, options: ActionOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn options(&self) -> ActionOptions {
        self.options.clone().unwrap_or_default()
    }

    /// Payload fields when the payload is a JSON object.
    pub fn payload_object(&self) -> Option<&Map<String, Value>> {
        self.payload.as_ref().and_then(Value::as_object)
    }
}

/// Server-reported issue time. Servers send epoch milliseconds or an
/// RFC 3339 string; anything else is kept verbatim so the envelope still
/// decodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IssuedAt {
    Millis(i64),
    Text(String),
    Other(Value),
}

impl Default for IssuedAt {
    fn default() -> Self {
        IssuedAt::Millis(0)
    }
}

impl IssuedAt {
    pub fn now() -> Self {
        IssuedAt::Millis(unix_millis_now())
    }

    pub fn as_millis(&self) -> Option<i64> {
        match self {
            IssuedAt::Millis(ms) => Some(*ms),
            IssuedAt::Text(text) => {
                let parsed = OffsetDateTime::parse(text, &Rfc3339).ok()?;
                Some((parsed.unix_timestamp_nanos() / 1_000_000) as i64)
            }
            IssuedAt::Other(value) => value.as_f64().map(|ms| ms as i64),
        }
    }
}

/// Uniform envelope returned for every action, remote or synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic_id: Option<String>,
    #[serde(default)]
    pub issued_at: IssuedAt,
    pub verb: String,
}

impl ActionResponse {
    pub fn success(verb: &Verb, data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            optimistic_id: None,
            issued_at: IssuedAt::now(),
            verb: verb.to_string(),
        }
    }

    pub fn failure(verb: &Verb, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
            optimistic_id: None,
            issued_at: IssuedAt::now(),
            verb: verb.to_string(),
        }
    }

    pub fn optimistic(verb: &Verb, data: Value, optimistic_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            optimistic_id: Some(optimistic_id.into()),
            issued_at: IssuedAt::now(),
            verb: verb.to_string(),
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic_id.is_some()
    }
}

pub fn unix_millis_now() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
