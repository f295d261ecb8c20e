pub mod binaries;
pub mod bus;
pub mod config_store;
pub mod filesystem;
pub mod instance;

pub use binaries::{BinaryRegistry, BinarySource, RegistryError, ResolvedBinary};
pub use bus::{Event, EventBus, LogEntry, LogLevel, LogStream, Subscription};
pub use config_store::ConfigStore;
pub use filesystem::{DirectoryListing, EntryKind, FileSystemBrowser, FsEntry, FsError};
pub use instance::{
    Instance, InstanceError, InstanceInfo, InstanceManager, InstanceStatus, InstanceStore,
    ManagerSettings, PortAllocator,
};
