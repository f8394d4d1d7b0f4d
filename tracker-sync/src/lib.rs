pub mod config;
pub mod session;
pub mod sync;

pub use config::SessionConfig;
pub use session::{Session, SessionStatus};
pub use sync::bootstrap::{BootstrapEngine, BootstrapError, Snapshot, SyncWatermark};
pub use sync::connectivity::{ConnectivityMonitor, TcpProbe};
pub use sync::dispatcher::{Dispatcher, SyncEvent, is_optimistic_id};
pub use sync::queue::{DrainReport, PendingOperation, PendingQueue, ReplayOutcome};
pub use sync::registry::{
    DEFAULT_RESOURCES, ListQuery, RegistryError, ResourceDescriptor, ResourceMethods,
    ResourceRegistry,
};
pub use sync::store::{LocalStore, RecordFilter, StoreError};
