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

use crate::modules::{
    driver::{DevicePtr, GpuDriverModule},
    platform_budget::PlatformBudgetModule,
};
use crate::vram_pool::VramPool;

use super::resident_page::ResidentPage;

/// A reserved virtual address range whose pages are backed on demand
pub(crate) struct Vbar {
    pub(crate) base: DevicePtr,
    pub(crate) device: i32,

    /// no page at or above this index may be resident (exclusive)
    pub(crate) watermark: usize,

    /// eviction never shrinks the watermark below this
    pub(crate) watermark_limit: usize,

    /// cached number of pages with physical backing
    pub(crate) resident_count: usize,

    pub(crate) pages: Box<[ResidentPage]>,
}

impl Vbar {
    pub(crate) fn new(base: DevicePtr, device: i32, pages: Box<[ResidentPage]>) -> Self {
        Self {
            base,
            device,
            watermark: pages.len(),
            watermark_limit: 0,
            resident_count: 0,
            pages,
        }
    }

    #[inline]
    pub(crate) fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub(crate) fn page_addr(&self, page_nr: usize, page_size: u64) -> DevicePtr {
        self.base + page_nr as u64 * page_size
    }

    /// Frees and/or unpins the page `page_nr`.
    ///
    /// The page is only freed if `do_free` is set, it is resident and
    /// it is not pinned (unless `do_unpin` is set as well).
    /// Returns `true` if the page was freed.
    pub(crate) fn evict_page<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        page_size: u64,
        page_nr: usize,
        do_free: bool,
        do_unpin: bool,
    ) -> bool {
        let vaddr = self.page_addr(page_nr, page_size);
        let page = &mut self.pages[page_nr];

        let freed = match page.handle {
            Some(handle) if do_free && (do_unpin || !page.pinned) => {
                pool.release(vaddr, page_size, handle);
                page.handle = None;
                true
            }
            _ => false,
        };
        if do_unpin {
            page.pinned = false;
        }

        if freed {
            self.resident_count -= 1;
        }
        freed
    }

    /// Moves the watermark down until `max_pages` pages were freed or the
    /// watermark limit is reached.
    ///
    /// The watermark also passes pages that are not resident or pinned.
    /// Returns the number of freed pages.
    pub(crate) fn shrink_tail<D: GpuDriverModule, P: PlatformBudgetModule>(
        &mut self,
        pool: &mut VramPool<D, P>,
        page_size: u64,
        max_pages: u64,
    ) -> u64 {
        let mut freed = 0;
        while freed < max_pages && self.watermark > self.watermark_limit {
            self.watermark -= 1;
            if self.evict_page(pool, page_size, self.watermark, true, false) {
                freed += 1;
            }
        }
        freed
    }

    /// First page at or after `cursor` that is not resident, bounded by the watermark
    pub(crate) fn first_absent(&self, mut cursor: usize) -> usize {
        while cursor < self.watermark && self.pages[cursor].is_resident() {
            cursor += 1;
        }
        cursor
    }

    pub(crate) fn count_resident(&self) -> usize {
        self.pages.iter().filter(|page| page.is_resident()).count()
    }

    pub(crate) fn count_pinned(&self) -> usize {
        self.pages.iter().filter(|page| page.pinned).count()
    }

    /// Unpinned pages at or above the watermark that are still resident
    pub(crate) fn count_resident_above_watermark(&self) -> usize {
        self.pages[self.watermark.min(self.nr_pages())..]
            .iter()
            .filter(|page| page.is_resident() && !page.pinned)
            .count()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn check_integrity(&self) {
        assert_eq!(
            self.count_resident(),
            self.resident_count,
            "resident count of VBAR {:#x} is out of sync",
            self.base
        );
        assert!(
            self.watermark_limit <= self.watermark && self.watermark <= self.nr_pages(),
            "watermark of VBAR {:#x} is out of bounds (limit: {}, watermark: {}, pages: {})",
            self.base,
            self.watermark_limit,
            self.watermark,
            self.nr_pages()
        );
        for (page_nr, page) in self.pages.iter().enumerate() {
            assert!(
                !page.pinned || page.is_resident(),
                "page {} of VBAR {:#x} is pinned but not resident",
                page_nr,
                self.base
            );
        }
        assert_eq!(
            self.count_resident_above_watermark(),
            0,
            "VBAR {:#x} has resident pages above its watermark",
            self.base
        );
    }
}
