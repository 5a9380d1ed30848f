//! The derived-file cache: on-disk store, build coordination, and the
//! size maintainer.

pub mod coordinator;
pub mod store;
pub mod sweeper;

pub use coordinator::BuildCoordinator;
pub use store::{CacheStore, Probe, ReadHandle, Reserve};
pub use sweeper::{SizeMaintainer, SweepPolicy};
