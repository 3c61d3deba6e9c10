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

use log::{debug, warn};

use crate::{modules::driver::DevicePtr, util::M};

use super::{vbar::Vbar, VbarHandle};

/// Snapshot of a single VBAR taken by [`VbarRegistry::analyze`](super::VbarRegistry::analyze)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct VbarAudit {
    #[cfg_attr(feature = "serde", serde(skip))]
    pub handle: VbarHandle,
    pub base: DevicePtr,
    pub nr_pages: usize,
    pub watermark: usize,
    pub watermark_limit: usize,

    /// resident pages according to the cached counter
    pub cached_resident: usize,

    /// resident pages according to the page map
    pub counted_resident: usize,

    pub pinned: usize,

    /// unpinned resident pages at or above the watermark
    pub resident_above_watermark: usize,
}

impl VbarAudit {
    pub(crate) fn of(handle: VbarHandle, vbar: &Vbar) -> Self {
        Self {
            handle,
            base: vbar.base,
            nr_pages: vbar.nr_pages(),
            watermark: vbar.watermark,
            watermark_limit: vbar.watermark_limit,
            cached_resident: vbar.resident_count,
            counted_resident: vbar.count_resident(),
            pinned: vbar.count_pinned(),
            resident_above_watermark: vbar.count_resident_above_watermark(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.cached_resident == self.counted_resident
            && self.resident_above_watermark == 0
            && self.watermark_limit <= self.watermark
            && self.watermark <= self.nr_pages
    }

    pub(crate) fn log(&self, page_size: u64) {
        debug!(
            "  VBAR {:#x}: {:>5} MB resident, watermark {}/{} (limit {}), {} pinned",
            self.base,
            self.counted_resident as u64 * page_size / M,
            self.watermark,
            self.nr_pages,
            self.watermark_limit,
            self.pinned
        );

        if self.cached_resident != self.counted_resident {
            warn!(
                "VBAR {:#x}: resident count mismatch (cached: {}, actual: {})",
                self.base, self.cached_resident, self.counted_resident
            );
        }
        if self.resident_above_watermark != 0 {
            warn!(
                "VBAR {:#x}: {} unpinned pages resident above watermark {}",
                self.base, self.resident_above_watermark, self.watermark
            );
        }
        if self.watermark_limit > self.watermark || self.watermark > self.nr_pages {
            warn!(
                "VBAR {:#x}: watermark {} outside of [{}, {}]",
                self.base, self.watermark, self.watermark_limit, self.nr_pages
            );
        }
    }
}

/// Result of a consistency audit over all VBARs, ordered from the highest
/// to the lowest priority
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AuditReport {
    pub vbars: Vec<VbarAudit>,

    /// resident bytes according to the page maps
    pub resident_bytes: u64,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.vbars.iter().all(|vbar| vbar.is_consistent())
    }
}
