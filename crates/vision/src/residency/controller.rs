//! Owner of the caption model and the only place that decides its tier.
//!
//! A single mutex guards the model handle and the pending-eviction marker.
//! `run` holds it for the whole request, and the idle timer thread takes the
//! same mutex before offloading, so migrations, inference and eviction never
//! interleave.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use ml_core::{DeviceTransferOps, ModelHandle, Precision, Tier, TieredModel};
use tracing::{debug, info, info_span, warn};

use crate::{
    config::{ResidencyMode, ResidencySettings},
    error::{PipelineError, VisionError},
    residency::timer::IdleEvictionTimer,
};

/// Precision used for weights that shuttle between tiers.
const ON_DEMAND_PRECISION: Precision = Precision::F16;

struct ResidencyState<M> {
    handle: ModelHandle<M>,
    /// Generation of the armed idle timer, if an eviction is outstanding.
    pending_eviction: Option<u64>,
}

struct Shared<M> {
    state: Mutex<ResidencyState<M>>,
    transfers: DeviceTransferOps,
}

impl<M: TieredModel> Shared<M> {
    // Location tags only change after confirmed transfers, so a poisoned
    // guard still protects a consistent handle.
    fn lock(&self) -> MutexGuard<'_, ResidencyState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_if_idle(&self, generation: u64) {
        let _span = info_span!("residency.evict", generation).entered();
        let mut state = self.lock();
        if state.pending_eviction != Some(generation) {
            debug!("idle timer superseded by a newer request");
            return;
        }
        state.pending_eviction = None;
        self.offload(&mut state);
    }

    fn offload(&self, state: &mut ResidencyState<M>) {
        match self.transfers.move_to_host(&mut state.handle) {
            Ok(Some(_)) => {
                metrics::counter!("residency_idle_evictions_total").increment(1);
            }
            Ok(None) => {}
            Err(err) => warn!("idle offload failed: {err:#}"),
        }
    }
}

/// Serializes access to a tiered model and keeps it on the tier its
/// residency mode calls for.
pub struct ResidencyController<M: TieredModel + 'static> {
    timer: Option<IdleEvictionTimer>,
    shared: Arc<Shared<M>>,
    mode: ResidencyMode,
    effective_mode: ResidencyMode,
    idle_timeout: Duration,
}

impl<M: TieredModel + 'static> ResidencyController<M> {
    /// Load the model via `load` onto the tier the mode calls for and perform
    /// the initial placement.
    ///
    /// When the mode needs a device and none is available the controller
    /// degrades to host-only for its whole lifetime.
    pub fn new<F>(
        settings: ResidencySettings,
        transfers: DeviceTransferOps,
        load: F,
    ) -> Result<Self, VisionError>
    where
        F: FnOnce(Tier) -> anyhow::Result<M>,
    {
        let device_available = transfers.device_available();
        let mode = settings.mode;
        let effective_mode = mode.resolve(device_available);
        info!("residency mode: {mode} (device available: {device_available})");
        if effective_mode != mode {
            warn!("{mode} mode requires a device; falling back to host-only placement");
        }

        let target = match effective_mode {
            ResidencyMode::Persistent => Tier::Device,
            ResidencyMode::OnDemand | ResidencyMode::HostOnly => Tier::Host,
        };
        let model = load(target).map_err(|err| VisionError::initialization("caption model", err))?;
        let mut handle = ModelHandle::new(model);

        let placed = match target {
            Tier::Device => transfers.move_to_device(&mut handle),
            Tier::Host => transfers.move_to_host(&mut handle),
        };
        placed.map_err(|err| VisionError::initialization("caption model placement", err))?;

        if effective_mode == ResidencyMode::OnDemand {
            transfers
                .prepare_on_demand(&mut handle, ON_DEMAND_PRECISION)
                .map_err(|err| VisionError::initialization("on-demand staging", err))?;
            info!(
                "on-demand residency: weights staged as {} on host, idle timeout {}s",
                handle.precision(),
                settings.idle_timeout.as_secs_f64()
            );
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(ResidencyState {
                handle,
                pending_eviction: None,
            }),
            transfers,
        });

        let timer = if effective_mode == ResidencyMode::OnDemand && !settings.idle_timeout.is_zero()
        {
            let weak: Weak<Shared<M>> = Arc::downgrade(&shared);
            let timer = IdleEvictionTimer::spawn("residency-idle-timer", move |generation| {
                if let Some(shared) = weak.upgrade() {
                    shared.evict_if_idle(generation);
                }
            })
            .map_err(|err| VisionError::initialization("idle eviction timer", err))?;
            Some(timer)
        } else {
            None
        };

        Ok(Self {
            timer,
            shared,
            mode,
            effective_mode,
            idle_timeout: settings.idle_timeout,
        })
    }

    /// Run `request` against the model with the guard held for its whole
    /// duration. Under on-demand residency the model is brought to the device
    /// first and an idle eviction is (re)armed afterwards, also when `request`
    /// fails or panics. A panic is re-raised once eviction is armed.
    pub fn run<R, F>(&self, request: F) -> Result<R, VisionError>
    where
        F: FnOnce(&M) -> Result<R, PipelineError>,
    {
        let span = info_span!("residency.run", mode = %self.effective_mode);
        let _enter = span.enter();

        let mut state = self.shared.lock();
        let on_demand = self.effective_mode == ResidencyMode::OnDemand;

        if on_demand {
            if let (Some(_), Some(timer)) = (state.pending_eviction.take(), &self.timer) {
                timer.cancel();
            }
            match self.shared.transfers.move_to_device(&mut state.handle) {
                Ok(Some(elapsed)) => debug!("transfer latency {:.3}s", elapsed.as_secs_f64()),
                Ok(None) => debug!("model already resident"),
                Err(source) => {
                    return Err(VisionError::Transfer {
                        mode: self.mode,
                        source,
                    });
                }
            }
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| request(state.handle.model())));

        if on_demand {
            self.schedule_eviction(&mut state);
        }

        match outcome {
            Ok(result) => result.map_err(VisionError::from),
            Err(payload) => {
                drop(state);
                warn!("request panicked with the caption model on {}", self.location());
                panic::resume_unwind(payload)
            }
        }
    }

    fn schedule_eviction(&self, state: &mut ResidencyState<M>) {
        match &self.timer {
            Some(timer) => state.pending_eviction = Some(timer.schedule(self.idle_timeout)),
            None => {
                state.pending_eviction = None;
                self.shared.offload(state);
            }
        }
    }

    pub fn location(&self) -> Tier {
        self.shared.lock().handle.location()
    }

    pub fn precision(&self) -> Precision {
        self.shared.lock().handle.precision()
    }

    pub fn has_pending_eviction(&self) -> bool {
        self.shared.lock().pending_eviction.is_some()
    }

    /// Mode requested at construction.
    pub fn mode(&self) -> ResidencyMode {
        self.mode
    }

    /// Mode in force after accounting for device availability.
    pub fn effective_mode(&self) -> ResidencyMode {
        self.effective_mode
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
