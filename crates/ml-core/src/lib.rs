//! Building blocks for keeping model weights on the right memory tier.
//!
//! - `tier`: device/host tiers and numeric precision tags.
//! - `model`: the `TieredModel` capability trait and the owning `ModelHandle`.
//! - `allocator`: device availability and explicit cache release.
//! - `transfer`: blocking migrations between tiers.
//! - `torch`: TorchScript-backed implementations (enable `with-tch`).

pub mod allocator;
pub mod model;
pub mod tier;
pub mod transfer;

#[cfg(feature = "with-tch")]
pub mod torch;

pub use allocator::DeviceAllocator;
pub use model::{ModelHandle, TieredModel};
pub use tier::{Precision, Tier};
pub use transfer::{DeviceTransferOps, TransferError, TransferOp};

#[cfg(feature = "with-tch")]
pub use tch;
