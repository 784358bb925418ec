//! Automatic hazard tracking and barrier generation.
//!
//! Every touched subresource carries a [`SyncState`]. Operations describe what
//! they need as a [`SyncRequest`]; [`try_build_barrier`] compares the two, updates
//! the state, and yields the barrier (if any) that makes the access safe. Barriers
//! are queued per recording in a [`PendingBarrierQueue`] and flushed as one
//! [`BarrierBatch`] in whichever native form the device supports.

mod access;
mod builder;
mod emit;
mod pending;
mod state;

pub use access::{legacy_access, legacy_stages, Access, WRITE_ACCESS};
pub use builder::{try_build_barrier, BarrierOutcome, ResourceBarrierInfo, SyncRequest};
pub use emit::{BarrierBatch, BarrierStrategy};
pub use pending::{BarrierTarget, PendingBarrier, PendingBarrierQueue};
pub use state::{PerStageReaders, ReadClass, SubresourceMap, SubresourceRange, SyncState};
