//! Blocking migrations of a [`ModelHandle`] between the device and host tiers.
//!
//! The operations take `&mut ModelHandle`, so two migrations of the same
//! handle can never overlap; callers serialize access with their own guard.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    allocator::DeviceAllocator,
    model::{ModelHandle, TieredModel},
    tier::{Precision, Tier},
};

/// Requested migration direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOp {
    ToDevice,
    ToHost,
    StageOnDemand,
}

impl TransferOp {
    pub fn label(self) -> &'static str {
        match self {
            TransferOp::ToDevice => "to_device",
            TransferOp::ToHost => "to_host",
            TransferOp::StageOnDemand => "stage_on_demand",
        }
    }

    fn target(self) -> Tier {
        match self {
            TransferOp::ToDevice => Tier::Device,
            TransferOp::ToHost | TransferOp::StageOnDemand => Tier::Host,
        }
    }
}

impl fmt::Display for TransferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{op} requested but the {allocator} allocator reports no device (weights on {location})")]
    DeviceUnavailable {
        op: TransferOp,
        location: Tier,
        allocator: String,
    },
    #[error("{op} failed; weights remain on {location}")]
    Migration {
        op: TransferOp,
        location: Tier,
        #[source]
        source: anyhow::Error,
    },
}

impl TransferError {
    pub fn op(&self) -> TransferOp {
        match self {
            TransferError::DeviceUnavailable { op, .. } | TransferError::Migration { op, .. } => *op,
        }
    }

    /// Last confirmed location of the weights when the error was raised.
    pub fn location(&self) -> Tier {
        match self {
            TransferError::DeviceUnavailable { location, .. }
            | TransferError::Migration { location, .. } => *location,
        }
    }
}

/// Device/host migration primitives bound to one device allocator.
#[derive(Clone)]
pub struct DeviceTransferOps {
    allocator: Arc<dyn DeviceAllocator>,
}

impl DeviceTransferOps {
    pub fn new(allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self { allocator }
    }

    pub fn device_available(&self) -> bool {
        self.allocator.is_available()
    }

    /// Reduce precision and pin host memory ahead of repeated on-demand
    /// migrations. Applied at most once per handle.
    pub fn prepare_on_demand<M: TieredModel>(
        &self,
        handle: &mut ModelHandle<M>,
        precision: Precision,
    ) -> Result<(), TransferError> {
        if handle.is_on_demand_ready() {
            return Ok(());
        }

        let current = handle.precision();
        if current != precision {
            handle
                .model_mut()
                .convert_precision(precision)
                .map_err(|source| TransferError::Migration {
                    op: TransferOp::StageOnDemand,
                    location: handle.location(),
                    source,
                })?;
            debug!("converted weights from {current} to {precision} for on-demand transfers");
        }

        if handle.location() == Tier::Host {
            handle
                .model_mut()
                .pin_host_memory()
                .map_err(|source| TransferError::Migration {
                    op: TransferOp::StageOnDemand,
                    location: handle.location(),
                    source,
                })?;
        }

        handle.mark_on_demand_ready();
        Ok(())
    }

    /// Copy weights to the device. Returns the elapsed time, or `None` when the
    /// handle was already resident and nothing moved.
    pub fn move_to_device<M: TieredModel>(
        &self,
        handle: &mut ModelHandle<M>,
    ) -> Result<Option<Duration>, TransferError> {
        if handle.location() == Tier::Device {
            return Ok(None);
        }
        if !self.allocator.is_available() {
            return Err(TransferError::DeviceUnavailable {
                op: TransferOp::ToDevice,
                location: handle.location(),
                allocator: self.allocator.name().to_string(),
            });
        }

        let elapsed = self.migrate(handle, TransferOp::ToDevice)?;
        info!(
            precision = %handle.precision(),
            "model moved to device in {:.3}s",
            elapsed.as_secs_f64()
        );
        Ok(Some(elapsed))
    }

    /// Copy weights back to host memory and release the vacated device pages.
    pub fn move_to_host<M: TieredModel>(
        &self,
        handle: &mut ModelHandle<M>,
    ) -> Result<Option<Duration>, TransferError> {
        if handle.location() == Tier::Host {
            return Ok(None);
        }

        let elapsed = self.migrate(handle, TransferOp::ToHost)?;
        if let Err(err) = self.allocator.release_cached() {
            warn!("weights offloaded but device cache release failed: {err:#}");
        }
        info!(
            "model offloaded to host in {:.3}s, device memory released",
            elapsed.as_secs_f64()
        );
        Ok(Some(elapsed))
    }

    fn migrate<M: TieredModel>(
        &self,
        handle: &mut ModelHandle<M>,
        op: TransferOp,
    ) -> Result<Duration, TransferError> {
        let previous = handle.location();
        let start = Instant::now();

        if let Err(source) = handle.model_mut().place(op.target()) {
            metrics::counter!("residency_transfer_failures_total", "direction" => op.label())
                .increment(1);
            restore(handle, previous);
            return Err(TransferError::Migration {
                op,
                location: handle.location(),
                source,
            });
        }

        handle.confirm_location(op.target());
        let elapsed = start.elapsed();
        metrics::histogram!("residency_transfer_seconds", "direction" => op.label())
            .record(elapsed.as_secs_f64());
        metrics::counter!("residency_migrations_total", "direction" => op.label()).increment(1);
        metrics::gauge!("residency_on_device")
            .set(if op.target() == Tier::Device { 1.0 } else { 0.0 });
        Ok(elapsed)
    }
}

/// Best-effort return to the last confirmed tier after a failed copy.
fn restore<M: TieredModel>(handle: &mut ModelHandle<M>, previous: Tier) {
    if handle.model().location() == previous {
        return;
    }
    if let Err(err) = handle.model_mut().place(previous) {
        error!("failed to restore weights to {previous} after aborted migration: {err:#}");
    }
}
