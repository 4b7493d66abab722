//! Persistent bundle storage engine for a Delay-Tolerant Networking node.
//!
//! Bundles arriving from ingress are striped across pre-sized segment
//! files, indexed by (destination, priority, expiration), and streamed back
//! out by a release controller; a restart rebuilds the whole index by
//! scanning the on-disk image. See `DESIGN.md` for the layout of the
//! subsystems.

pub mod allocator;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod custody;
pub mod diskio;
pub mod eid;
pub mod engine;
pub mod error;
pub mod messages;
pub mod restore;
pub mod ring;
pub mod router;
pub mod segment;
pub mod session;
pub mod store;

pub use allocator::{AllocatorSnapshot, SegmentAllocator};
pub use catalog::{BundleCatalog, BundleUuid, CatalogEntry};
pub use codec::primary::PrimaryFields;
pub use config::{DiskConfig, StorageConfig, StorageImplementation};
pub use custody::{CustodyBookkeeping, CustodyIdAllocator, CustodyManager, NoopCustody};
pub use eid::Eid;
pub use engine::BundleStorageManager;
pub use error::{Error, Result};
pub use restore::{RestoreScanner, RestoreStats};
pub use router::{inproc_fabric, InprocFabric, InprocPeer, MessageFabric, StorageRouter};
pub use session::{ReadSession, WriteSession};
pub use store::SegmentStore;
