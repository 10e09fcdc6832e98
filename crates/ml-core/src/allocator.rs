use anyhow::Result;

/// Accelerator memory allocator seen by the transfer layer.
pub trait DeviceAllocator: Send + Sync {
    fn is_available(&self) -> bool;

    /// Hand cached-but-unused device pages back to the driver so other
    /// consumers can allocate them.
    fn release_cached(&self) -> Result<()>;

    fn name(&self) -> &str {
        "device"
    }
}
