use anyhow::Result;

use crate::tier::{Precision, Tier};

/// Capability interface for a model whose weights can move between tiers.
///
/// Implementations perform the actual copy in `place`; bookkeeping of the
/// confirmed location is done by [`ModelHandle`].
pub trait TieredModel: Send {
    type Input;
    type Output;

    /// Move all weights to `tier`, blocking until the copy completes.
    fn place(&mut self, tier: Tier) -> Result<()>;

    /// Tier the weights currently live on, as reported by the backend.
    fn location(&self) -> Tier;

    fn precision(&self) -> Precision;

    /// Convert the stored weights to `precision` in place.
    fn convert_precision(&mut self, precision: Precision) -> Result<()>;

    /// Page-lock host weights so host→device copies can use DMA.
    fn pin_host_memory(&mut self) -> Result<()> {
        Ok(())
    }

    fn infer(&self, input: &Self::Input) -> Result<Self::Output>;
}

/// Exclusive owner of a loaded model plus its confirmed location tag.
///
/// The tag only changes after a transfer has completed, so after a failed
/// migration it still names the last tier the weights were known to be on.
pub struct ModelHandle<M> {
    model: M,
    location: Tier,
    on_demand_ready: bool,
}

impl<M: TieredModel> ModelHandle<M> {
    pub fn new(model: M) -> Self {
        let location = model.location();
        Self {
            model,
            location,
            on_demand_ready: false,
        }
    }

    pub fn location(&self) -> Tier {
        self.location
    }

    pub fn precision(&self) -> Precision {
        self.model.precision()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Whether the one-time on-demand staging has already been applied.
    pub fn is_on_demand_ready(&self) -> bool {
        self.on_demand_ready
    }

    pub(crate) fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub(crate) fn confirm_location(&mut self, tier: Tier) {
        self.location = tier;
    }

    pub(crate) fn mark_on_demand_ready(&mut self) {
        self.on_demand_ready = true;
    }
}
