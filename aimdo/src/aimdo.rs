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

use log::{debug, error, info};

use crate::{
    aimdo_config::AimdoConfig,
    budget_tracker::BudgetTracker,
    error::AimdoError,
    modules::{
        driver::{DevicePtr, GpuDriverModule},
        platform_budget::PlatformBudgetModule,
    },
    util::M,
    vbar_registry::{AuditReport, VbarHandle, VbarRegistry},
    vram_buffer::VramAllocator,
    vram_pool::VramPool,
};

/// Memory usage as seen by aimdo and by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct VramStats {
    /// physical memory committed through aimdo
    pub recorded_usage: u64,
    pub capacity: u64,

    /// `None` if the driver query failed
    pub driver_free: Option<u64>,
    pub driver_total: Option<u64>,
}

/// The VRAM overcommit context of one device.
///
/// VBARs and VRAM buffers share the physical memory of the device.
/// Whenever committing memory fails or the budget predicts a shortage,
/// memory is reclaimed from the VBARs with the lowest priority.
///
/// Dropping the context frees every VBAR and buffer.
pub struct Aimdo<D: GpuDriverModule, P: PlatformBudgetModule> {
    device: i32,
    config: AimdoConfig,
    pool: VramPool<D, P>,
    vbars: VbarRegistry,
    buffers: VramAllocator,
}

impl<D: GpuDriverModule, P: PlatformBudgetModule> Aimdo<D, P> {
    pub fn new(
        mut driver: D,
        platform: P,
        device: i32,
        config: AimdoConfig,
    ) -> Result<Self, AimdoError> {
        config.validate()?;

        let capacity = driver.device_total_mem(device).map_err(|err| {
            error!("Could not query the memory of device {}: {}", device, err);
            AimdoError::Driver(err)
        })?;
        let name = driver
            .device_name(device)
            .unwrap_or_else(|| "<unknown>".to_string());

        let budget = BudgetTracker::new(
            capacity,
            config.vram_headroom,
            platform,
            config.platform_headroom,
            config.budget_poll_interval,
        );

        info!("aimdo inited for GPU: {} (VRAM: {} MB)", name, capacity / M);

        Ok(Self {
            device,
            pool: VramPool::new(driver, budget),
            vbars: VbarRegistry::new(config.vbar_page_size),
            buffers: VramAllocator::new(config.vram_chunk_size, config.min_alloc_size),
            config,
        })
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn config(&self) -> &AimdoConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        self.pool.driver()
    }

    pub fn driver_mut(&mut self) -> &mut D {
        self.pool.driver_mut()
    }

    pub fn budget(&self) -> &BudgetTracker<P> {
        self.pool.budget()
    }

    pub fn vbars(&self) -> &VbarRegistry {
        &self.vbars
    }

    pub fn buffers(&self) -> &VramAllocator {
        &self.buffers
    }

    /// Physical memory committed through this context
    pub fn total_vram_usage(&self) -> u64 {
        self.pool.budget().resident_usage()
    }

    /// See [`BudgetTracker::deficit`]
    pub fn deficit(&mut self, extra_bytes: u64) -> u64 {
        self.pool.deficit(self.device, extra_bytes)
    }

    /// Reserves a VBAR of `size` bytes with the highest priority.
    ///
    /// No physical memory is committed until the VBAR is faulted.
    pub fn allocate_vbar(&mut self, size: u64, device: i32) -> Result<VbarHandle, AimdoError> {
        self.vbars.allocate(&mut self.pool, size, device)
    }

    /// Makes `[offset, offset + size)` of the VBAR resident and pins it.
    ///
    /// Returns the serial of every page in the range.
    pub fn fault(
        &mut self,
        vbar: VbarHandle,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u32>, AimdoError> {
        self.vbars.fault(&mut self.pool, vbar, offset, size)
    }

    pub fn unpin(&mut self, vbar: VbarHandle, offset: u64, size: u64) -> Result<(), AimdoError> {
        self.vbars.unpin(&mut self.pool, vbar, offset, size)
    }

    pub fn free_vbar(&mut self, vbar: VbarHandle) -> Result<(), AimdoError> {
        self.vbars.free(&mut self.pool, vbar)
    }

    pub fn prioritize(&mut self, vbar: VbarHandle) -> Result<(), AimdoError> {
        self.vbars.prioritize(vbar)
    }

    pub fn deprioritize(&mut self, vbar: VbarHandle) -> Result<(), AimdoError> {
        self.vbars.deprioritize(vbar)
    }

    pub fn set_watermark_limit(&mut self, vbar: VbarHandle, size: u64) -> Result<(), AimdoError> {
        self.vbars.set_watermark_limit(vbar, size)
    }

    pub fn reset_watermark_limits(&mut self) {
        self.vbars.reset_all_watermark_limits()
    }

    pub fn vbar_base(&self, vbar: VbarHandle) -> Result<DevicePtr, AimdoError> {
        self.vbars.base(vbar)
    }

    pub fn loaded_size(&self, vbar: VbarHandle) -> Result<u64, AimdoError> {
        self.vbars.loaded_size(vbar)
    }

    /// Shrinks the VBAR by up to `size` bytes and returns how many bytes were freed
    pub fn free_vbar_memory(&mut self, vbar: VbarHandle, size: u64) -> Result<u64, AimdoError> {
        self.vbars.free_memory(&mut self.pool, vbar, size)
    }

    /// Reclaims `size` bytes from the VBARs with the lowest priority.
    ///
    /// Returns how many bytes were freed.
    pub fn evict_global(&mut self, size: u64) -> u64 {
        self.vbars.evict_global(&mut self.pool, size)
    }

    /// Reclaims memory until the VBAR could hold all pages below `target_page`
    pub fn evict_for_vbar(&mut self, vbar: VbarHandle, target_page: usize) {
        self.vbars.evict_for_vbar(&mut self.pool, vbar, target_page)
    }

    /// Allocation entry point of the framework
    pub fn alloc(&mut self, size: u64, device: i32) -> Result<DevicePtr, AimdoError> {
        self.buffers.alloc(&mut self.pool, &mut self.vbars, size, device)
    }

    pub fn free(&mut self, ptr: DevicePtr) {
        self.buffers.free(&mut self.pool, ptr)
    }

    /// Reserves a growable buffer of up to `max_size` bytes and returns its base address
    pub fn create_buffer(&mut self, device: i32, max_size: u64) -> Result<DevicePtr, AimdoError> {
        self.buffers.create(&mut self.pool, device, max_size)
    }

    pub fn grow_buffer(&mut self, buffer: DevicePtr, size: u64) -> Result<(), AimdoError> {
        self.buffers.grow(&mut self.pool, &mut self.vbars, buffer, size)
    }

    pub fn buffer_base(&self, buffer: DevicePtr) -> Result<DevicePtr, AimdoError> {
        self.buffers.get(buffer)
    }

    pub fn destroy_buffer(&mut self, buffer: DevicePtr) -> Result<(), AimdoError> {
        self.buffers.destroy(&mut self.pool, buffer)
    }

    pub fn stats(&mut self) -> VramStats {
        let (driver_free, driver_total) = match self.pool.driver_mut().mem_get_info() {
            Ok((free, total)) => (Some(free), Some(total)),
            Err(err) => {
                error!("Could not query free device memory: {}", err);
                (None, None)
            }
        };

        VramStats {
            recorded_usage: self.total_vram_usage(),
            capacity: self.pool.budget().capacity(),
            driver_free,
            driver_total,
        }
    }

    /// Logs the memory usage and audits all VBARs.
    ///
    /// Returns `None` if the VBARs did not change since the last audit.
    pub fn analyze(&mut self) -> Option<AuditReport> {
        let stats = self.stats();

        debug!("--- VRAM Stats ---");
        debug!("  Aimdo Recorded Usage: {:>7} MB", stats.recorded_usage / M);
        if let (Some(free), Some(total)) = (stats.driver_free, stats.driver_total) {
            debug!("  Driver: {:>7} MB / {:>7} MB Free", free / M, total / M);
        }

        let report = self.vbars.analyze();
        self.buffers.analyze();
        report
    }
}

impl<D: GpuDriverModule, P: PlatformBudgetModule> Drop for Aimdo<D, P> {
    fn drop(&mut self) {
        self.vbars.free_all(&mut self.pool);
        self.buffers.free_all(&mut self.pool);
        debug!("aimdo context of device {} dropped", self.device);
    }
}
