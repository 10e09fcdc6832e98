//! TorchScript-backed tier management.

use std::{
    panic::{self, AssertUnwindSafe},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use tch::{CModule, Cuda, Device, Kind, Tensor};
use tracing::{debug, warn};

use crate::{
    allocator::DeviceAllocator,
    model::TieredModel,
    tier::{Precision, Tier},
};

const C10_CUDA_LIBS: [&str; 2] = ["libc10_cuda.so", "libtorch_cuda.so"];
const EMPTY_CACHE_SYMBOL: &[u8] = b"_ZN3c104cuda20CUDACachingAllocator10emptyCacheEv\0";

fn kind_for(precision: Precision) -> Kind {
    match precision {
        Precision::F32 => Kind::Float,
        Precision::F16 => Kind::Half,
        Precision::Bf16 => Kind::BFloat16,
    }
}

/// Caption model loaded from a TorchScript export.
pub struct TorchCaptionModel {
    module: CModule,
    device_index: usize,
    location: Tier,
    precision: Precision,
}

impl TorchCaptionModel {
    /// Load the module directly onto `tier`.
    pub fn load<P: AsRef<Path>>(model_path: P, tier: Tier, device_index: usize) -> Result<Self> {
        let path = model_path.as_ref();
        let device = Self::device_for(tier, device_index);
        let module = CModule::load_on_device(path, device)
            .with_context(|| format!("failed to load caption model {}", path.display()))?;
        Ok(Self {
            module,
            device_index,
            location: tier,
            precision: Precision::F32,
        })
    }

    pub fn device(&self) -> Device {
        Self::device_for(self.location, self.device_index)
    }

    fn device_for(tier: Tier, device_index: usize) -> Device {
        match tier {
            Tier::Device => Device::Cuda(device_index),
            Tier::Host => Device::Cpu,
        }
    }

    // tch panics on libtorch errors; migrations must surface them as values.
    fn retarget(&mut self, device: Device, kind: Kind) -> Result<()> {
        let module = &mut self.module;
        panic::catch_unwind(AssertUnwindSafe(|| module.to(device, kind, false)))
            .map_err(|_| anyhow!("libtorch rejected move to {device:?} as {kind:?}"))
    }
}

impl TieredModel for TorchCaptionModel {
    type Input = Tensor;
    type Output = Tensor;

    fn place(&mut self, tier: Tier) -> Result<()> {
        let device = Self::device_for(tier, self.device_index);
        self.retarget(device, kind_for(self.precision))?;
        self.location = tier;
        Ok(())
    }

    fn location(&self) -> Tier {
        self.location
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn convert_precision(&mut self, precision: Precision) -> Result<()> {
        self.retarget(self.device(), kind_for(precision))?;
        self.precision = precision;
        Ok(())
    }

    fn pin_host_memory(&mut self) -> Result<()> {
        if self.location != Tier::Host {
            return Ok(());
        }
        let pin_device = Device::Cuda(self.device_index);
        for (name, mut param) in self.module.named_parameters()? {
            let pinned = param
                .f_pin_memory(pin_device)
                .with_context(|| format!("failed to pin parameter {name}"))?;
            param.set_data(&pinned);
        }
        Ok(())
    }

    fn infer(&self, input: &Tensor) -> Result<Tensor> {
        let input = input
            .f_to_device(self.device())?
            .f_to_kind(kind_for(self.precision))?;
        Ok(self.module.forward_ts(&[input])?)
    }
}

/// CUDA caching allocator of the linked libtorch.
pub struct TorchCudaAllocator {
    device_index: usize,
    empty_cache: Option<unsafe extern "C" fn()>,
    _library: Option<Library>,
}

impl TorchCudaAllocator {
    pub fn new(device_index: usize) -> Self {
        let mut allocator = Self {
            device_index,
            empty_cache: None,
            _library: None,
        };
        if !Cuda::is_available() {
            return allocator;
        }

        for lib in C10_CUDA_LIBS {
            let library = match unsafe { Library::open(Some(lib), RTLD_NOW | RTLD_GLOBAL) } {
                Ok(library) => library,
                Err(err) => {
                    debug!("could not open {lib}: {err}");
                    continue;
                }
            };
            let empty_cache =
                match unsafe { library.get::<unsafe extern "C" fn()>(EMPTY_CACHE_SYMBOL) } {
                    Ok(symbol) => *symbol,
                    Err(err) => {
                        debug!("{lib} does not export emptyCache: {err}");
                        continue;
                    }
                };
            allocator.empty_cache = Some(empty_cache);
            allocator._library = Some(library);
            debug!("resolved CUDA cache release from {lib}");
            return allocator;
        }

        warn!("CUDA caching allocator release not found; freed VRAM stays cached by libtorch");
        allocator
    }
}

impl DeviceAllocator for TorchCudaAllocator {
    fn is_available(&self) -> bool {
        Cuda::is_available() && (self.device_index as i64) < Cuda::device_count()
    }

    fn release_cached(&self) -> Result<()> {
        Cuda::synchronize(self.device_index as i64);
        if let Some(empty_cache) = self.empty_cache {
            unsafe { empty_cache() };
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "cuda"
    }
}
