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

mod audit;
mod resident_page;
mod vbar;

#[cfg(test)]
mod test;

pub use audit::{AuditReport, VbarAudit};

use log::{debug, error, info};

use crate::{
    error::{AimdoError, DriverError},
    modules::{
        driver::{DevicePtr, GpuDriverModule},
        platform_budget::PlatformBudgetModule,
    },
    util::{
        div_ceil,
        priority_list::{EntryHandle, PriorityList},
        K, M,
    },
    vram_pool::VramPool,
};
use resident_page::ResidentPage;
use vbar::Vbar;

/// Identifies a VBAR of a [`VbarRegistry`].
///
/// A handle of a freed VBAR stays invalid, even if its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VbarHandle(EntryHandle);

impl VbarHandle {
    /// Packs this handle into a non zero integer, e.g. to pass it over the C ABI
    pub fn to_raw(self) -> u64 {
        self.0.to_raw()
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        EntryHandle::from_raw(raw).map(VbarHandle)
    }
}

/// All VBARs of a context, ordered by priority.
///
/// Memory is always reclaimed from the VBAR with the lowest priority first
/// and from the tail of a VBAR downwards.
pub struct VbarRegistry {
    vbars: PriorityList<Vbar>,
    page_size: u64,

    /// set by every mutation, cleared by `analyze`
    dirty: bool,
}

impl VbarRegistry {
    pub(crate) const fn new(page_size: u64) -> Self {
        Self {
            vbars: PriorityList::new(),
            page_size,
            dirty: false,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of live VBARs
    pub fn len(&self) -> usize {
        self.vbars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vbars.is_empty()
    }

    /// Handles of all VBARs, from the highest to the lowest priority
    pub fn handles(&self) -> impl Iterator<Item = VbarHandle> + '_ {
        self.vbars.iter().map(|(handle, _)| VbarHandle(handle))
    }

    pub(crate) fn allocate<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        size: u64,
        device: i32,
    ) -> Result<VbarHandle, AimdoError> {
        debug!("vbar_allocate (start): size={}M, device={}", size / M, device);

        // a VBAR never needs more pages than the device can hold
        let max_pages = div_ceil(pool.budget().capacity(), self.page_size);
        let nr_pages = div_ceil(size, self.page_size).min(max_pages);
        let reserved_size = nr_pages * self.page_size;

        let nr_pages = usize::try_from(nr_pages).map_err(|_| AimdoError::HostOutOfMemory)?;
        let mut pages = Vec::new();
        if pages.try_reserve_exact(nr_pages).is_err() {
            error!("Host OOM while allocating the page map of a VBAR");
            return Err(AimdoError::HostOutOfMemory);
        }
        pages.resize(nr_pages, ResidentPage::default());

        let base = pool.reserve(reserved_size).map_err(|err| {
            error!("Could not reserve virtual address space for VBAR: {}", err);
            AimdoError::AddressSpace(err)
        })?;

        let handle = match self
            .vbars
            .push_highest(Vbar::new(base, device, pages.into_boxed_slice()))
        {
            Ok(handle) => VbarHandle(handle),
            Err(_) => {
                error!("Host OOM while inserting VBAR");
                pool.free_address(base, reserved_size);
                return Err(AimdoError::HostOutOfMemory);
            }
        };

        self.dirty = true;
        self.check_integrity();

        debug!("vbar_allocate (return): vbar={:#x}", base);
        Ok(handle)
    }

    /// Base address of the VBAR
    pub fn base(&self, handle: VbarHandle) -> Result<DevicePtr, AimdoError> {
        Ok(self.get(handle)?.base)
    }

    pub fn nr_pages(&self, handle: VbarHandle) -> Result<usize, AimdoError> {
        Ok(self.get(handle)?.nr_pages())
    }

    pub fn watermark(&self, handle: VbarHandle) -> Result<usize, AimdoError> {
        Ok(self.get(handle)?.watermark)
    }

    pub fn watermark_limit(&self, handle: VbarHandle) -> Result<usize, AimdoError> {
        Ok(self.get(handle)?.watermark_limit)
    }

    /// Number of bytes that currently have physical backing
    pub fn loaded_size(&self, handle: VbarHandle) -> Result<u64, AimdoError> {
        Ok(self.get(handle)?.resident_count as u64 * self.page_size)
    }

    /// Returns `true` if the page `page_nr` has physical backing
    pub fn is_resident(&self, handle: VbarHandle, page_nr: usize) -> Result<bool, AimdoError> {
        let vbar = self.get(handle)?;
        Ok(vbar.pages.get(page_nr).is_some_and(|page| page.is_resident()))
    }

    /// Returns `true` if the page `page_nr` is pinned
    pub fn is_pinned(&self, handle: VbarHandle, page_nr: usize) -> Result<bool, AimdoError> {
        let vbar = self.get(handle)?;
        Ok(vbar.pages.get(page_nr).is_some_and(|page| page.pinned))
    }

    /// Gives the VBAR the highest priority and lets it use all of its pages again
    pub(crate) fn prioritize(&mut self, handle: VbarHandle) -> Result<(), AimdoError> {
        debug!("vbar_prioritize: vbar={:?}", handle);

        if !self.vbars.move_to_highest(handle.0) {
            return Err(AimdoError::InvalidHandle);
        }
        let vbar = self.get_mut(handle)?;
        vbar.watermark = vbar.nr_pages();

        self.dirty = true;
        self.check_integrity();
        Ok(())
    }

    /// Gives the VBAR the lowest priority, its watermark stays untouched
    pub(crate) fn deprioritize(&mut self, handle: VbarHandle) -> Result<(), AimdoError> {
        debug!("vbar_deprioritize: vbar={:?}", handle);

        if !self.vbars.move_to_lowest(handle.0) {
            return Err(AimdoError::InvalidHandle);
        }

        self.dirty = true;
        Ok(())
    }

    /// Protects the first `size` bytes of the VBAR from being reclaimed
    /// until [`reset_all_watermark_limits`](Self::reset_all_watermark_limits) is called.
    pub(crate) fn set_watermark_limit(
        &mut self,
        handle: VbarHandle,
        size: u64,
    ) -> Result<(), AimdoError> {
        let page_size = self.page_size;
        let vbar = self.get_mut(handle)?;

        let limit = div_ceil(size, page_size).min(vbar.nr_pages() as u64) as usize;
        vbar.watermark_limit = limit;
        if vbar.watermark < limit {
            // memory below the limit has to stay usable
            vbar.watermark = limit;
        }
        debug!(
            "vbar_set_watermark_limit: vbar={:#x}, limit={} pages",
            vbar.base, limit
        );

        self.dirty = true;
        self.check_integrity();
        Ok(())
    }

    pub(crate) fn reset_all_watermark_limits(&mut self) {
        debug!("vbars_reset_watermark_limits");

        let mut curr = self.vbars.highest();
        while let Some(handle) = curr {
            if let Some(vbar) = self.vbars.get_mut(handle) {
                vbar.watermark_limit = 0;
            }
            curr = self.vbars.lower(handle);
        }

        self.dirty = true;
    }

    /// Makes `[offset, offset + size)` resident and pins it.
    ///
    /// Returns the serial of every page in the range. A serial only changes
    /// if the page got new physical backing.
    ///
    /// Fails with [`AimdoError::OutOfMemory`] if the range reaches the
    /// watermark or no memory could be reclaimed. Pages committed before
    /// the failure stay resident, but not pinned.
    pub(crate) fn fault<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        handle: VbarHandle,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u32>, AimdoError> {
        debug!(
            "vbar_fault (start): offset={}k, size={}k",
            offset / K,
            size / K
        );

        let page_size = self.page_size;
        let vbar = self.get(handle)?;
        let page_start = (offset / page_size) as usize;
        let page_end = match offset.checked_add(size) {
            Some(end) => div_ceil(end, page_size) as usize,
            None => usize::MAX,
        };

        if page_end > vbar.watermark {
            debug!("VBAR allocation is above watermark");
            return Err(AimdoError::OutOfMemory);
        }

        let mut signature = Vec::new();
        signature.try_reserve_exact(page_end.saturating_sub(page_start))?;

        self.dirty = true;
        let res = self.fault_pages(pool, handle, page_start, page_end, &mut signature);
        if res.is_ok() {
            let vbar = self.get_mut(handle)?;
            for page in &mut vbar.pages[page_start..page_end] {
                page.pinned = true;
            }
        }
        self.check_integrity();

        debug!("vbar_fault (return): {:?}", res);
        res.map(|_| signature)
    }

    fn fault_pages<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        handle: VbarHandle,
        page_start: usize,
        page_end: usize,
        signature: &mut Vec<u32>,
    ) -> Result<(), AimdoError> {
        let page_size = self.page_size;

        for page_nr in page_start..page_end {
            let vbar = self.get(handle)?;
            if page_nr >= vbar.watermark {
                // reclaiming for an earlier page shrank this VBAR
                return Err(AimdoError::OutOfMemory);
            }

            let page = &vbar.pages[page_nr];
            if page.is_resident() {
                signature.push(page.serial);
                continue;
            }

            let vaddr = vbar.page_addr(page_nr, page_size);
            let device = vbar.device;

            let physical = match pool.commit(vaddr, page_size, device) {
                Ok(physical) => physical,
                Err(DriverError::OutOfMemory) => {
                    debug!("VBAR allocation attempt exceeds available VRAM, reclaiming memory");
                    self.evict_for_vbar(pool, handle, page_end);

                    if page_nr >= self.get(handle)?.watermark {
                        debug!("VBAR allocation cancelled due to watermark reduction");
                        return Err(AimdoError::OutOfMemory);
                    }

                    match pool.commit(vaddr, page_size, device) {
                        Ok(physical) => physical,
                        Err(DriverError::OutOfMemory) => {
                            info!("VRAM allocation failed (OOM)");
                            return Err(AimdoError::OutOfMemory);
                        }
                        Err(err) => {
                            error!("VRAM allocation failed: {}", err);
                            return Err(AimdoError::Driver(err));
                        }
                    }
                }
                Err(err) => {
                    error!("VRAM allocation failed (non OOM): {}", err);
                    return Err(AimdoError::Driver(err));
                }
            };

            let vbar = self.get_mut(handle)?;
            let page = &mut vbar.pages[page_nr];
            page.handle = Some(physical);
            page.serial = page.serial.wrapping_add(1);
            signature.push(page.serial);
            vbar.resident_count += 1;
        }

        Ok(())
    }

    /// Unpins `[offset, offset + size)`.
    ///
    /// Pages of the range that are at or above the watermark are evicted,
    /// as the watermark passed them while they were pinned.
    pub(crate) fn unpin<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        handle: VbarHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), AimdoError> {
        let page_size = self.page_size;
        let vbar = self.get_mut(handle)?;

        let page_end = match offset.checked_add(size) {
            Some(end) => div_ceil(end, page_size).min(vbar.nr_pages() as u64) as usize,
            None => vbar.nr_pages(),
        };
        let page_start = ((offset / page_size) as usize).min(page_end);

        if page_end > vbar.watermark {
            // device work might still use these pages
            pool.synchronize();
        }

        for page_nr in page_start..page_end {
            let do_free = page_nr >= vbar.watermark;
            vbar.evict_page(pool, page_size, page_nr, do_free, true);
        }

        self.dirty = true;
        self.check_integrity();
        Ok(())
    }

    /// Evicts every page of the VBAR, regardless of pins, and releases its address range
    pub(crate) fn free<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        handle: VbarHandle,
    ) -> Result<(), AimdoError> {
        debug!("vbar_free: vbar={:?}", handle);

        if !self.vbars.contains(handle.0) {
            return Err(AimdoError::InvalidHandle);
        }

        pool.synchronize();

        let mut vbar = self
            .vbars
            .remove(handle.0)
            .ok_or(AimdoError::InvalidHandle)?;
        for page_nr in 0..vbar.nr_pages() {
            vbar.evict_page(pool, self.page_size, page_nr, true, true);
        }
        pool.free_address(vbar.base, vbar.nr_pages() as u64 * self.page_size);

        self.dirty = true;
        self.check_integrity();
        Ok(())
    }

    /// Frees every VBAR
    pub(crate) fn free_all<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
    ) {
        while let Some(handle) = self.vbars.highest() {
            if let Err(err) = self.free(pool, VbarHandle(handle)) {
                error!("Could not free VBAR: {}", err);
                break;
            }
        }
    }

    /// Shrinks the VBAR by up to `size` bytes from its tail.
    ///
    /// Returns the number of bytes that were actually freed.
    pub(crate) fn free_memory<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        handle: VbarHandle,
        size: u64,
    ) -> Result<u64, AimdoError> {
        debug!("vbar_free_memory (start): size={}k", size / K);

        let page_size = self.page_size;
        let pages_to_free = div_ceil(size, page_size);
        let vbar = self.get_mut(handle)?;
        if pages_to_free == 0 {
            return Ok(0);
        }

        pool.synchronize();
        let freed = vbar.shrink_tail(pool, page_size, pages_to_free) * page_size;

        self.dirty = true;
        self.check_integrity();

        debug!("vbar_free_memory (return): freed={}k", freed / K);
        Ok(freed)
    }

    /// Reclaims at least `size` bytes if possible, from the VBAR with the
    /// lowest priority upwards.
    ///
    /// Returns the number of bytes that were freed.
    pub(crate) fn evict_global<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        size: u64,
    ) -> u64 {
        let page_size = self.page_size;
        let mut pages_needed = div_ceil(size, page_size);
        if pages_needed == 0 {
            return 0;
        }

        debug!("vbars_free: size={}M", size / M);
        pool.synchronize();

        let mut curr = self.vbars.lowest();
        while let Some(handle) = curr {
            if pages_needed == 0 {
                break;
            }
            if let Some(vbar) = self.vbars.get_mut(handle) {
                pages_needed -= vbar.shrink_tail(pool, page_size, pages_needed);
            }
            curr = self.vbars.higher(handle);
        }

        let freed = (div_ceil(size, page_size) - pages_needed) * page_size;
        self.dirty = true;
        self.check_integrity();

        debug!("vbars_free: freed={}M", freed / M);
        freed
    }

    /// Reclaims memory for a fault of `handle` that needs the pages up to
    /// `target` (exclusive).
    ///
    /// Walks the VBARs like [`evict_global`](Self::evict_global), but stops
    /// as soon as the first page of `handle` that is not resident is at or
    /// after `target`. `handle` itself can be shrunk as well if it is the
    /// VBAR with the lowest remaining priority.
    pub(crate) fn evict_for_vbar<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        handle: VbarHandle,
        target: usize,
    ) {
        let page_size = self.page_size;
        let mut cursor = match self.vbars.get(handle.0) {
            Some(vbar) => vbar.first_absent(0),
            None => return,
        };

        pool.synchronize();

        let mut curr = self.vbars.lowest();
        'walk: while let Some(victim) = curr {
            loop {
                let own_watermark = match self.vbars.get(handle.0) {
                    Some(vbar) => vbar.watermark,
                    None => break 'walk,
                };
                if cursor >= target || cursor >= own_watermark {
                    break 'walk;
                }

                let Some(vbar) = self.vbars.get_mut(victim) else {
                    break;
                };
                if vbar.watermark <= vbar.watermark_limit {
                    break;
                }

                vbar.watermark -= 1;
                let page_nr = vbar.watermark;
                if vbar.evict_page(pool, page_size, page_nr, true, false) {
                    cursor = match self.vbars.get(handle.0) {
                        Some(vbar) => vbar.first_absent(cursor + 1),
                        None => break 'walk,
                    };
                }
            }
            curr = self.vbars.higher(victim);
        }

        self.dirty = true;
        self.check_integrity();
    }

    /// Audits the page maps of all VBARs and logs every inconsistency.
    ///
    /// Nothing is corrected. Returns `None` if nothing changed since the last audit.
    pub fn analyze(&mut self) -> Option<AuditReport> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;

        debug!("--- VBAR Usage ---");

        let mut report = AuditReport::default();
        for (handle, vbar) in self.vbars.iter() {
            let audit = VbarAudit::of(VbarHandle(handle), vbar);
            audit.log(self.page_size);

            report.resident_bytes += audit.counted_resident as u64 * self.page_size;
            report.vbars.push(audit);
        }

        debug!("  Total VBAR resident: {:>7} MB", report.resident_bytes / M);
        Some(report)
    }

    fn get(&self, handle: VbarHandle) -> Result<&Vbar, AimdoError> {
        self.vbars.get(handle.0).ok_or(AimdoError::InvalidHandle)
    }

    fn get_mut(&mut self, handle: VbarHandle) -> Result<&mut Vbar, AimdoError> {
        self.vbars.get_mut(handle.0).ok_or(AimdoError::InvalidHandle)
    }

    /// Asserts the page map invariants of all VBARs in debug builds
    #[inline]
    pub(crate) fn check_integrity(&self) {
        #[cfg(debug_assertions)]
        for (_, vbar) in self.vbars.iter() {
            vbar.check_integrity();
        }
    }
}
