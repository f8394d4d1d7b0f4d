pub mod backoff;
pub mod bootstrap;
pub mod connectivity;
pub mod dispatcher;
pub mod queue;
pub mod registry;
pub mod store;
