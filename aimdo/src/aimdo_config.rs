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

use core::time::Duration;

use static_assertions::const_assert_eq;

use crate::{error::AimdoError, util::M};

/// Page size of a VBAR
pub const VBAR_PAGE_SIZE: u64 = 32 * M;

/// Size of the physical chunks a VRAM buffer grows by
pub const VRAM_CHUNK_SIZE: u64 = 16 * M;

/// Allocations of the framework allocator are rounded up to this size
/// (2 MB as per CUDA page size and the pytorch caching allocator)
pub const MIN_ALLOC_SIZE: u64 = 2 * M;

pub const VRAM_HEADROOM: u64 = 256 * M;

pub const PLATFORM_BUDGET_HEADROOM: u64 = 512 * M;

pub const BUDGET_POLL_INTERVAL: Duration = Duration::from_millis(2000);

const_assert_eq!(VBAR_PAGE_SIZE % VRAM_CHUNK_SIZE, 0);
const_assert_eq!(VRAM_CHUNK_SIZE % MIN_ALLOC_SIZE, 0);

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AimdoConfig {
    pub vbar_page_size: u64,
    pub vram_chunk_size: u64,
    pub min_alloc_size: u64,

    /// Bytes that are kept free on the device at all times
    pub vram_headroom: u64,

    /// Bytes that are kept free below the budget the platform reports
    pub platform_headroom: u64,

    /// Platform budget queries can be expensive (cross process),
    /// so they are not issued more often than this
    pub budget_poll_interval: Duration,
}

impl Default for AimdoConfig {
    fn default() -> Self {
        Self {
            vbar_page_size: VBAR_PAGE_SIZE,
            vram_chunk_size: VRAM_CHUNK_SIZE,
            min_alloc_size: MIN_ALLOC_SIZE,
            vram_headroom: VRAM_HEADROOM,
            platform_headroom: PLATFORM_BUDGET_HEADROOM,
            budget_poll_interval: BUDGET_POLL_INTERVAL,
        }
    }
}

impl AimdoConfig {
    pub(crate) fn validate(&self) -> Result<(), AimdoError> {
        if self.vbar_page_size == 0 || self.vram_chunk_size == 0 || self.min_alloc_size == 0 {
            return Err(AimdoError::InvalidConfig("sizes have to be greater than zero"));
        }
        if self.vbar_page_size % self.vram_chunk_size != 0 {
            return Err(AimdoError::InvalidConfig(
                "VBAR page size has to be a multiple of the chunk size",
            ));
        }
        if self.vram_chunk_size % self.min_alloc_size != 0 {
            return Err(AimdoError::InvalidConfig(
                "chunk size has to be a multiple of the minimum allocation size",
            ));
        }
        Ok(())
    }
}
