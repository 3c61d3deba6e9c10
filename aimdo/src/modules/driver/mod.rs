#[cfg(feature = "cuda")]
mod cuda;
pub mod simulated;

#[cfg(feature = "cuda")]
pub use cuda::CudaDriverModule;
pub use simulated::{SimulatedCall, SimulatedDriverModule};

use core::num::NonZeroU64;

use crate::error::DriverError;

/// Virtual address on the device
pub type DevicePtr = u64;

/// Driver token of a committed slab of physical device memory
pub type PhysicalHandle = NonZeroU64;

/// The driver-level primitives the engine is built on.
///
/// All sizes and addresses passed to the virtual memory functions are
/// multiples of the allocation granularity of the device.
pub trait GpuDriverModule {
    /// Total physical memory of `device` in bytes
    fn device_total_mem(&mut self, device: i32) -> Result<u64, DriverError>;

    /// Human readable name of `device`
    fn device_name(&mut self, _device: i32) -> Option<String> {
        None
    }

    /// Returns `(free, total)` bytes of the current device, as seen by the driver
    fn mem_get_info(&mut self) -> Result<(u64, u64), DriverError>;

    /// Reserves `size` bytes of virtual address space without any physical backing
    fn reserve_address(&mut self, size: u64) -> Result<DevicePtr, DriverError>;

    /// Frees a range previously reserved with `reserve_address`
    fn free_address(&mut self, ptr: DevicePtr, size: u64) -> Result<(), DriverError>;

    /// Creates `size` bytes of physical memory on `device`
    fn create_physical(&mut self, size: u64, device: i32) -> Result<PhysicalHandle, DriverError>;

    /// Maps `handle` at `vaddr`
    fn map(&mut self, vaddr: DevicePtr, size: u64, handle: PhysicalHandle) -> Result<(), DriverError>;

    /// Grants `device` read/write access to `[vaddr, vaddr + size)`
    fn set_access(&mut self, vaddr: DevicePtr, size: u64, device: i32) -> Result<(), DriverError>;

    fn unmap(&mut self, vaddr: DevicePtr, size: u64) -> Result<(), DriverError>;

    /// Releases physical memory. The memory is freed once it is unmapped everywhere.
    fn release_physical(&mut self, handle: PhysicalHandle) -> Result<(), DriverError>;

    /// Blocks until all outstanding work of the device is finished
    fn synchronize(&mut self) -> Result<(), DriverError>;
}

impl<T: GpuDriverModule + ?Sized> GpuDriverModule for Box<T> {
    fn device_total_mem(&mut self, device: i32) -> Result<u64, DriverError> {
        (**self).device_total_mem(device)
    }

    fn device_name(&mut self, device: i32) -> Option<String> {
        (**self).device_name(device)
    }

    fn mem_get_info(&mut self) -> Result<(u64, u64), DriverError> {
        (**self).mem_get_info()
    }

    fn reserve_address(&mut self, size: u64) -> Result<DevicePtr, DriverError> {
        (**self).reserve_address(size)
    }

    fn free_address(&mut self, ptr: DevicePtr, size: u64) -> Result<(), DriverError> {
        (**self).free_address(ptr, size)
    }

    fn create_physical(&mut self, size: u64, device: i32) -> Result<PhysicalHandle, DriverError> {
        (**self).create_physical(size, device)
    }

    fn map(&mut self, vaddr: DevicePtr, size: u64, handle: PhysicalHandle) -> Result<(), DriverError> {
        (**self).map(vaddr, size, handle)
    }

    fn set_access(&mut self, vaddr: DevicePtr, size: u64, device: i32) -> Result<(), DriverError> {
        (**self).set_access(vaddr, size, device)
    }

    fn unmap(&mut self, vaddr: DevicePtr, size: u64) -> Result<(), DriverError> {
        (**self).unmap(vaddr, size)
    }

    fn release_physical(&mut self, handle: PhysicalHandle) -> Result<(), DriverError> {
        (**self).release_physical(handle)
    }

    fn synchronize(&mut self) -> Result<(), DriverError> {
        (**self).synchronize()
    }
}
