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

use std::time::{Duration, Instant};

use log::debug;

use crate::{
    modules::platform_budget::{PlatformBudget, PlatformBudgetModule},
    util::M,
};

/// Tracks the VRAM that is resident through this process against the
/// capacity of the device.
pub struct BudgetTracker<P: PlatformBudgetModule> {
    /// Physical capacity of the device
    capacity: u64,

    /// Bytes of physical memory that are currently committed
    resident_usage: u64,

    headroom: u64,

    platform: P,
    platform_headroom: u64,
    poll_interval: Duration,
    last_poll: Option<Instant>,

    /// Last platform reading and `resident_usage` at the time of that reading
    last_reading: Option<(PlatformBudget, u64)>,
}

impl<P: PlatformBudgetModule> BudgetTracker<P> {
    pub(crate) fn new(
        capacity: u64,
        headroom: u64,
        platform: P,
        platform_headroom: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            capacity,
            resident_usage: 0,
            headroom,
            platform,
            platform_headroom,
            poll_interval,
            last_poll: None,
            last_reading: None,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn resident_usage(&self) -> u64 {
        self.resident_usage
    }

    pub(crate) fn record_commit(&mut self, size: u64) {
        self.resident_usage += size;
    }

    pub(crate) fn record_release(&mut self, size: u64) {
        debug_assert!(
            self.resident_usage >= size,
            "released more than was committed (usage: {}, size: {})",
            self.resident_usage,
            size
        );
        self.resident_usage = self.resident_usage.saturating_sub(size);
    }

    /// Returns how many bytes committing `extra_bytes` would exceed the
    /// safe capacity of the device by.
    ///
    /// The most pessimistic of the internal bookkeeping, the driver's view
    /// (`free_vram` as reported by the driver, if available) and the platform
    /// budget is taken. Returns 0 if no source reports a deficit.
    pub fn deficit(&mut self, device: i32, extra_bytes: u64, free_vram: Option<u64>) -> u64 {
        let extra = extra_bytes as i128;

        let mut deficit = self.resident_usage as i128 + extra + self.headroom as i128
            - self.capacity as i128;
        let mut method = "internal accounting";

        if let Some(free) = free_vram {
            let deficit_driver = self.headroom as i128 + extra - free as i128;
            if deficit_driver > deficit {
                deficit = deficit_driver;
                method = "driver free memory";
            }
        }

        if let Some((current_usage, budget)) = self.platform_usage() {
            let deficit_platform =
                current_usage + extra + self.platform_headroom as i128 - budget as i128;
            if deficit_platform > deficit {
                deficit = deficit_platform;
                method = "platform budget";
            }
        }

        if deficit > 0 {
            debug!(
                "Imminent VRAM OOM detected on device {}. Deficit: {} MB ({})",
                device,
                deficit / M as i128,
                method
            );
            deficit.min(u64::MAX as i128) as u64
        } else {
            0
        }
    }

    /// Usage the platform accounts to this process and the budget,
    /// polled at most once per `poll_interval`.
    ///
    /// Between polls the last reading is advanced by what was committed or released since.
    fn platform_usage(&mut self) -> Option<(i128, u64)> {
        let now = Instant::now();
        let poll_due = match self.last_poll {
            Some(last_poll) => now.duration_since(last_poll) >= self.poll_interval,
            None => true,
        };

        if poll_due {
            self.last_poll = Some(now);
            self.last_reading = self
                .platform
                .query()
                .map(|reading| (reading, self.resident_usage));
        }

        let (reading, usage_at_poll) = self.last_reading?;
        let current_usage =
            reading.current_usage as i128 + self.resident_usage as i128 - usage_at_poll as i128;
        Some((current_usage, reading.budget))
    }
}
