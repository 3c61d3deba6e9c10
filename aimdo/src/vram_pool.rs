/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use log::{error, trace};

use crate::{
    budget_tracker::BudgetTracker,
    error::DriverError,
    modules::{
        driver::{DevicePtr, GpuDriverModule, PhysicalHandle},
        platform_budget::PlatformBudgetModule,
    },
};

/// The physical VRAM shared by VBARs and VRAM buffers.
///
/// Every commit and release of physical memory goes through this pool, so
/// the budget tracker always knows how much is resident.
pub struct VramPool<D: GpuDriverModule, P: PlatformBudgetModule> {
    driver: D,
    budget: BudgetTracker<P>,
}

impl<D: GpuDriverModule, P: PlatformBudgetModule> VramPool<D, P> {
    pub(crate) fn new(driver: D, budget: BudgetTracker<P>) -> Self {
        Self { driver, budget }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn budget(&self) -> &BudgetTracker<P> {
        &self.budget
    }

    pub(crate) fn reserve(&mut self, size: u64) -> Result<DevicePtr, DriverError> {
        self.driver.reserve_address(size)
    }

    pub(crate) fn free_address(&mut self, ptr: DevicePtr, size: u64) {
        if let Err(err) = self.driver.free_address(ptr, size) {
            error!("Could not free virtual address range {:#x} ({} bytes): {}", ptr, size, err);
        }
    }

    /// Allocates physical memory, maps it at `vaddr` and makes it accessible to `device`.
    ///
    /// Nothing stays allocated or mapped if any of these steps fails.
    pub(crate) fn commit(
        &mut self,
        vaddr: DevicePtr,
        size: u64,
        device: i32,
    ) -> Result<PhysicalHandle, DriverError> {
        let handle = self.driver.create_physical(size, device)?;

        if let Err(err) = self.driver.map(vaddr, size, handle) {
            self.release_quietly(handle);
            return Err(err);
        }

        if let Err(err) = self.driver.set_access(vaddr, size, device) {
            if let Err(unmap_err) = self.driver.unmap(vaddr, size) {
                error!("Could not unmap {:#x} after failed access setup: {}", vaddr, unmap_err);
            }
            self.release_quietly(handle);
            return Err(err);
        }

        self.budget.record_commit(size);
        trace!("Committed {} bytes at {:#x}", size, vaddr);
        Ok(handle)
    }

    /// Unmaps and releases physical memory committed with `commit`
    pub(crate) fn release(&mut self, vaddr: DevicePtr, size: u64, handle: PhysicalHandle) {
        if let Err(err) = self.driver.unmap(vaddr, size) {
            error!("Could not unmap {:#x} ({} bytes): {}", vaddr, size, err);
        }
        self.release_quietly(handle);
        self.budget.record_release(size);
        trace!("Released {} bytes at {:#x}", size, vaddr);
    }

    /// Waits until the device does not use any memory anymore that might get unmapped
    pub(crate) fn synchronize(&mut self) {
        if let Err(err) = self.driver.synchronize() {
            error!("Device synchronization failed: {}", err);
        }
    }

    /// See [`BudgetTracker::deficit`]
    pub(crate) fn deficit(&mut self, device: i32, extra_bytes: u64) -> u64 {
        let free_vram = match self.driver.mem_get_info() {
            Ok((free, _)) => Some(free),
            Err(err) => {
                error!("Could not query free device memory: {}", err);
                None
            }
        };
        self.budget.deficit(device, extra_bytes, free_vram)
    }

    fn release_quietly(&mut self, handle: PhysicalHandle) {
        if let Err(err) = self.driver.release_physical(handle) {
            error!("Could not release physical memory: {}", err);
        }
    }
}
