//! Access descriptors and the authorization resolver.
//!
//! A descriptor is a small JSON sidecar that sits next to a container directory
//! (`.container.auth`) or next to a blob (`<blob>.auth`). The resolver picks the
//! authoritative one for a target and evaluates read/write for a caller. Every
//! missing, empty or unreadable input degrades to "admins only".

pub mod descriptor;
pub mod derive;
pub mod store;
pub mod resolver;

pub use descriptor::{AccessDescriptor, AccessLevel};
pub use derive::{carries_access_signals, derive_descriptor, split_list};
pub use store::{CreateOutcome, DescriptorKey, DescriptorLookup, DescriptorStore, FileDescriptorStore};
pub use resolver::{AuthorizationResolver, AuthzDecision, DescriptorSource, Permission, Target};
