use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tracker_core::{Action, ActionOptions, ActionResponse, Operation, Verb};

use super::dispatcher::Dispatcher;
use super::store::RecordFilter;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown resource kind: {0}")]
    UnknownResource(String),
    #[error("invalid resource kind {0:?}: expected a lowercase identifier")]
    InvalidKind(String),
    #[error("resource kind {0:?} is reserved")]
    ReservedKind(String),
    #[error("resource kind {0:?} is declared twice")]
    DuplicateKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: &'static str,
    pub display_name: &'static str,
}

impl ResourceDescriptor {
    pub const fn new(kind: &'static str, display_name: &'static str) -> Self {
        Self { kind, display_name }
    }

    /// Key under which a bootstrap snapshot carries this kind's records.
    pub fn collection(&self) -> String {
        format!("{}s", self.kind)
    }
}

pub static DEFAULT_RESOURCES: &[ResourceDescriptor] = &[
    ResourceDescriptor::new("team", "Team"),
    ResourceDescriptor::new("project", "Project"),
    ResourceDescriptor::new("label", "Label"),
    ResourceDescriptor::new("issue", "Issue"),
    ResourceDescriptor::new("comment", "Comment"),
    ResourceDescriptor::new("reaction", "Reaction"),
];

const RESERVED_KINDS: &[&str] = &["workspace", "meta"];

/// Lookup table built once from a static descriptor list.
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    descriptors: &'static [ResourceDescriptor],
    by_kind: HashMap<&'static str, &'static ResourceDescriptor>,
}

impl ResourceRegistry {
    pub fn new(descriptors: &'static [ResourceDescriptor]) -> Result<Self, RegistryError> {
        let mut by_kind = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            validate_kind(descriptor.kind)?;
            if by_kind.insert(descriptor.kind, descriptor).is_some() {
                return Err(RegistryError::DuplicateKind(descriptor.kind.to_string()));
            }
        }
        Ok(Self {
            descriptors,
            by_kind,
        })
    }

    pub fn lookup(&self, kind: &str) -> Result<&'static ResourceDescriptor, RegistryError> {
        self.by_kind
            .get(kind)
            .copied()
            .ok_or_else(|| RegistryError::UnknownResource(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    pub fn descriptors(&self) -> &'static [ResourceDescriptor] {
        self.descriptors
    }
}

fn validate_kind(kind: &str) -> Result<(), RegistryError> {
    let mut chars = kind.chars();
    let valid_head = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid_head || !valid_tail {
        return Err(RegistryError::InvalidKind(kind.to_string()));
    }
    if RESERVED_KINDS.contains(&kind) {
        return Err(RegistryError::ReservedKind(kind.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub parent_id: Option<String>,
    pub filter: Option<RecordFilter>,
}

impl ListQuery {
    pub fn under(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            filter: None,
        }
    }

    pub fn matching(filter: RecordFilter) -> Self {
        Self {
            parent_id: None,
            filter: Some(filter),
        }
    }
}

/// CRUD accessors for one resource kind. Each call builds an [`Action`] and
/// hands it to the dispatcher.
#[derive(Clone)]
pub struct ResourceMethods<'a> {
    dispatcher: &'a Dispatcher,
    descriptor: &'static ResourceDescriptor,
    options: Option<ActionOptions>,
}

impl<'a> ResourceMethods<'a> {
    pub const OPERATIONS: [Operation; 5] = Operation::ALL;

    pub(crate) fn new(dispatcher: &'a Dispatcher, descriptor: &'static ResourceDescriptor) -> Self {
        Self {
            dispatcher,
            descriptor,
            options: None,
        }
    }

    pub fn descriptor(&self) -> &'static ResourceDescriptor {
        self.descriptor
    }

    pub fn with_options(mut self, options: ActionOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn action(&self, operation: Operation) -> Action {
        let mut action = Action::new(Verb::resource(self.descriptor.kind, operation));
        action.options = self.options.clone();
        action
    }

    pub async fn create(&self, payload: Value) -> ActionResponse {
        let action = self.action(Operation::Create).with_payload(payload);
        self.dispatcher.execute(action).await
    }

    pub async fn update(&self, id: &str, payload: Value) -> ActionResponse {
        let action = self
            .action(Operation::Update)
            .with_resource_id(id)
            .with_payload(payload);
        self.dispatcher.execute(action).await
    }

    pub async fn delete(&self, id: &str) -> ActionResponse {
        let action = self.action(Operation::Delete).with_resource_id(id);
        self.dispatcher.execute(action).await
    }

    pub async fn get(&self, id: &str) -> ActionResponse {
        let action = self.action(Operation::Get).with_resource_id(id);
        self.dispatcher.execute(action).await
    }

    pub async fn list(&self, query: ListQuery) -> ActionResponse {
        let mut action = self.action(Operation::List);
        action.parent_id = query.parent_id;
        action.payload = query.filter.map(Value::Object);
        self.dispatcher.execute(action).await
    }
}
