mod action;
mod client;

pub use action::{
    Action, ActionOptions, ActionResponse, BOOTSTRAP_VERB, IssuedAt, Operation, Verb, VerbError,
    unix_millis_now,
};
pub use client::{ActionClient, ApiErrorClass, ClientError, DEFAULT_REQUEST_TIMEOUT};
