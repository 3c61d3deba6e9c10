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

mod buffer;

use std::collections::HashMap;

use log::{debug, error, warn};

use crate::{
    error::{AimdoError, DriverError},
    modules::{
        driver::{DevicePtr, GpuDriverModule},
        platform_budget::PlatformBudgetModule,
    },
    util::{round_up_to_nearest, M},
    vbar_registry::VbarRegistry,
    vram_pool::VramPool,
};
use buffer::VramBuffer;

/// Growable VRAM buffers, looked up by their base address.
///
/// Backs both the allocations of the framework and standalone buffers.
pub struct VramAllocator {
    buffers: HashMap<DevicePtr, VramBuffer>,
    chunk_size: u64,
    min_alloc_size: u64,
}

impl VramAllocator {
    pub(crate) fn new(chunk_size: u64, min_alloc_size: u64) -> Self {
        Self {
            buffers: HashMap::new(),
            chunk_size,
            min_alloc_size,
        }
    }

    /// Number of live buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Allocates `size` bytes of VRAM, reclaiming memory from `vbars` if needed
    pub(crate) fn alloc<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        vbars: &mut VbarRegistry,
        size: u64,
        device: i32,
    ) -> Result<DevicePtr, AimdoError> {
        debug!("alloc_fn (start): size={}, device={}", size, device);

        let size = self.round_to_min_alloc(size)?;
        let ptr = self.create(pool, device, size)?;
        if let Err(err) = self.grow(pool, vbars, ptr, size) {
            debug!("alloc_fn (FAILED): {}", err);
            self.destroy(pool, ptr)?;
            return Err(err);
        }

        debug!("alloc_fn (return): ptr={:#x}", ptr);
        Ok(ptr)
    }

    /// Frees an allocation of [`alloc`](Self::alloc). Unknown pointers are ignored.
    pub(crate) fn free<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        ptr: DevicePtr,
    ) {
        if ptr == 0 {
            return;
        }
        match self.destroy(pool, ptr) {
            Ok(()) => debug!("free_fn: ptr={:#x}", ptr),
            Err(_) => warn!("free_fn could not find pointer {:#x} in lookup table", ptr),
        }
    }

    /// Reserves a buffer of up to `max_size` bytes (rounded up to the minimum
    /// allocation size) and returns its base address.
    pub(crate) fn create<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        device: i32,
        max_size: u64,
    ) -> Result<DevicePtr, AimdoError> {
        let max_size = self.round_to_min_alloc(max_size)?;
        self.buffers.try_reserve(1)?;

        let buffer = VramBuffer::create(pool, device, max_size)?;
        let base = buffer.base();
        self.buffers.insert(base, buffer);
        Ok(base)
    }

    /// Sizes this close to `u64::MAX` can never be reserved
    fn round_to_min_alloc(&self, size: u64) -> Result<u64, AimdoError> {
        round_up_to_nearest(size, self.min_alloc_size).ok_or_else(|| {
            error!("Could not reserve virtual address space for {} bytes", size);
            AimdoError::AddressSpace(DriverError::OutOfMemory)
        })
    }

    /// Grows the buffer at `ptr` so that at least `size` bytes are backed
    pub(crate) fn grow<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        vbars: &mut VbarRegistry,
        ptr: DevicePtr,
        size: u64,
    ) -> Result<(), AimdoError> {
        let buffer = self.buffers.get_mut(&ptr).ok_or(AimdoError::InvalidHandle)?;
        buffer.grow(pool, vbars, self.chunk_size, size)
    }

    /// Base address of the buffer
    pub fn get(&self, ptr: DevicePtr) -> Result<DevicePtr, AimdoError> {
        self.buffers
            .get(&ptr)
            .map(|buffer| buffer.base())
            .ok_or(AimdoError::InvalidHandle)
    }

    /// Bytes of the buffer that have physical backing
    pub fn allocated(&self, ptr: DevicePtr) -> Result<u64, AimdoError> {
        self.buffers
            .get(&ptr)
            .map(|buffer| buffer.allocated())
            .ok_or(AimdoError::InvalidHandle)
    }

    pub fn max_size(&self, ptr: DevicePtr) -> Result<u64, AimdoError> {
        self.buffers
            .get(&ptr)
            .map(|buffer| buffer.max_size())
            .ok_or(AimdoError::InvalidHandle)
    }

    pub(crate) fn destroy<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        ptr: DevicePtr,
    ) -> Result<(), AimdoError> {
        let buffer = self.buffers.remove(&ptr).ok_or(AimdoError::InvalidHandle)?;
        buffer.destroy(pool);
        Ok(())
    }

    pub(crate) fn free_all<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
    ) {
        for (_, buffer) in self.buffers.drain() {
            buffer.destroy(pool);
        }
    }

    /// Logs every live buffer
    pub(crate) fn analyze(&self) {
        debug!("--- Allocated Buffers ---");

        let mut buffers: Vec<_> = self.buffers.values().collect();
        buffers.sort_by_key(|buffer| buffer.base());
        for buffer in buffers {
            debug!(
                "  {:#x}: {:>7} MB / {:>7} MB",
                buffer.base(),
                buffer.allocated() / M,
                buffer.max_size() / M
            );
        }
        if self.buffers.is_empty() {
            debug!("  (none)");
        }
    }
}

impl Drop for VramAllocator {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            error!("{} VRAM buffers were leaked", self.buffers.len());
        }
    }
}
