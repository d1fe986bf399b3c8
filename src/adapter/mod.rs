//! Collaborators the protocol core consumes but does not implement: the
//! kernel configuration backend, the schema library and the discovery beacon.
pub mod discovery;
pub mod kernel;
pub mod memory;
pub mod schema;

pub use discovery::{DiscoveryBeacon, LogBeacon, ServiceDescriptor};
pub use kernel::{KernelAdapter, KernelError, KernelObject, ObjectKind, Route, Vrf};
pub use memory::MemoryKernel;
pub use schema::{SchemaContext, SchemaError, SchemaLibrary};
