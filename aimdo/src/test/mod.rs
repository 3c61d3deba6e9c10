use std::{cell::RefCell, rc::Rc};

use crate::{
    error::DriverError,
    modules::{
        driver::{DevicePtr, GpuDriverModule, PhysicalHandle, SimulatedDriverModule},
        platform_budget::NoPlatformBudgetModule,
    },
    Aimdo, AimdoConfig, VBAR_PAGE_SIZE,
};

mod plugin;

pub(crate) const PAGE: u64 = VBAR_PAGE_SIZE;

/// Default config without any headroom, so that tests can fill the device exactly
pub(crate) fn get_test_config() -> AimdoConfig {
    AimdoConfig {
        vram_headroom: 0,
        platform_headroom: 0,
        ..Default::default()
    }
}

pub(crate) fn get_test_aimdo(capacity: u64) -> Aimdo<SimulatedDriverModule, NoPlatformBudgetModule> {
    let _ = env_logger::builder().is_test(true).try_init();

    Aimdo::new(
        SimulatedDriverModule::new(capacity),
        NoPlatformBudgetModule,
        0,
        get_test_config(),
    )
    .unwrap()
}

/// Simulated driver whose state can still be inspected after the context was dropped
#[derive(Clone)]
pub(crate) struct SharedDriver(pub(crate) Rc<RefCell<SimulatedDriverModule>>);

impl SharedDriver {
    pub(crate) fn new(capacity: u64) -> Self {
        Self(Rc::new(RefCell::new(SimulatedDriverModule::new(capacity))))
    }
}

impl GpuDriverModule for SharedDriver {
    fn device_total_mem(&mut self, device: i32) -> Result<u64, DriverError> {
        self.0.borrow_mut().device_total_mem(device)
    }

    fn mem_get_info(&mut self) -> Result<(u64, u64), DriverError> {
        self.0.borrow_mut().mem_get_info()
    }

    fn reserve_address(&mut self, size: u64) -> Result<DevicePtr, DriverError> {
        self.0.borrow_mut().reserve_address(size)
    }

    fn free_address(&mut self, ptr: DevicePtr, size: u64) -> Result<(), DriverError> {
        self.0.borrow_mut().free_address(ptr, size)
    }

    fn create_physical(&mut self, size: u64, device: i32) -> Result<PhysicalHandle, DriverError> {
        self.0.borrow_mut().create_physical(size, device)
    }

    fn map(&mut self, vaddr: DevicePtr, size: u64, handle: PhysicalHandle) -> Result<(), DriverError> {
        self.0.borrow_mut().map(vaddr, size, handle)
    }

    fn set_access(&mut self, vaddr: DevicePtr, size: u64, device: i32) -> Result<(), DriverError> {
        self.0.borrow_mut().set_access(vaddr, size, device)
    }

    fn unmap(&mut self, vaddr: DevicePtr, size: u64) -> Result<(), DriverError> {
        self.0.borrow_mut().unmap(vaddr, size)
    }

    fn release_physical(&mut self, handle: PhysicalHandle) -> Result<(), DriverError> {
        self.0.borrow_mut().release_physical(handle)
    }

    fn synchronize(&mut self) -> Result<(), DriverError> {
        self.0.borrow_mut().synchronize()
    }
}
