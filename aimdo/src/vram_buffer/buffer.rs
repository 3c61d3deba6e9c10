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

use log::{debug, error, info, trace};

use crate::{
    error::{AimdoError, DriverError},
    modules::{
        driver::{DevicePtr, GpuDriverModule, PhysicalHandle},
        platform_budget::PlatformBudgetModule,
    },
    util::{div_ceil, round_up_to_nearest, K},
    vbar_registry::VbarRegistry,
    vram_pool::VramPool,
};

/// A flat device buffer that grows chunk by chunk up to a reserved maximum.
///
/// Committed chunks stay committed until the buffer is destroyed.
pub(crate) struct VramBuffer {
    base: DevicePtr,
    device: i32,
    max_size: u64,

    /// bytes that have physical backing, always starting at `base`
    allocated: u64,

    /// committed chunks in address order with their size
    chunks: Vec<(u64, PhysicalHandle)>,
}

impl VramBuffer {
    /// Reserves `max_size` bytes of address space without committing anything
    pub(crate) fn create<D: GpuDriverModule, P: PlatformBudgetModule>(
        pool: &mut VramPool<D, P>,
        device: i32,
        max_size: u64,
    ) -> Result<Self, AimdoError> {
        let base = pool.reserve(max_size).map_err(|err| {
            error!("Could not reserve virtual address space for VRAM buffer: {}", err);
            AimdoError::AddressSpace(err)
        })?;

        Ok(Self {
            base,
            device,
            max_size,
            allocated: 0,
            chunks: Vec::new(),
        })
    }

    #[inline]
    pub(crate) fn base(&self) -> DevicePtr {
        self.base
    }

    #[inline]
    pub(crate) fn allocated(&self) -> u64 {
        self.allocated
    }

    #[inline]
    pub(crate) fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Makes sure at least `required` bytes have physical backing.
    ///
    /// Memory is reclaimed from `vbars` if the budget predicts a shortage
    /// and once more if a chunk still runs out of memory.
    pub(crate) fn grow<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        vbars: &mut VbarRegistry,
        chunk_size: u64,
        required: u64,
    ) -> Result<(), AimdoError> {
        if required > self.max_size {
            return Err(AimdoError::ExceedsReservation {
                requested: required,
                max: self.max_size,
            });
        }
        if required <= self.allocated {
            return Ok(());
        }

        let grow_to = round_up_to_nearest(required, chunk_size)
            .map_or(self.max_size, |size| size.min(self.max_size));
        let new_chunks = div_ceil(grow_to - self.allocated, chunk_size);
        self.chunks.try_reserve(new_chunks as usize)?;

        let deficit = pool.deficit(self.device, grow_to - self.allocated);
        vbars.evict_global(pool, deficit);

        while self.allocated < grow_to {
            let size = (grow_to - self.allocated).min(chunk_size);
            let vaddr = self.base + self.allocated;

            let handle = match pool.commit(vaddr, size, self.device) {
                Ok(handle) => handle,
                Err(DriverError::OutOfMemory) => {
                    debug!("VRAM buffer allocation attempt exceeds available VRAM, reclaiming memory");
                    vbars.evict_global(pool, chunk_size);

                    match pool.commit(vaddr, size, self.device) {
                        Ok(handle) => handle,
                        Err(err) => {
                            if err.is_oom() {
                                info!("VRAM allocation failed (OOM)");
                            } else {
                                error!("VRAM allocation failed: {}", err);
                            }
                            return Err(err.into());
                        }
                    }
                }
                Err(err) => {
                    error!("VRAM allocation failed (non OOM): {}", err);
                    return Err(err.into());
                }
            };

            self.chunks.push((size, handle));
            trace!("Allocated VRAM buffer chunk @{:#x}, size {}k", vaddr, size / K);
            self.allocated += size;
        }

        Ok(())
    }

    /// Releases every chunk and the reserved address range
    pub(crate) fn destroy<D: GpuDriverModule, P: PlatformBudgetModule>(
        self,
        pool: &mut VramPool<D, P>,
    ) {
        let mut offset = 0;
        for (size, handle) in self.chunks {
            pool.release(self.base + offset, size, handle);
            offset += size;
        }
        pool.free_address(self.base, self.max_size);
    }
}
