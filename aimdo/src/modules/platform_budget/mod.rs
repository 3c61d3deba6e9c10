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

/// Snapshot of the VRAM budget the operating system grants this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlatformBudget {
    /// bytes the platform accounts to this process
    pub current_usage: u64,

    /// bytes the platform lets this process use
    pub budget: u64,
}

/// A source for the VRAM budget of the platform (e.g. the video memory
/// budget of the windows display driver model).
///
/// Queries can be expensive, the budget tracker rate limits them.
pub trait PlatformBudgetModule {
    /// Returns `None` if the platform has no budget or the query failed
    fn query(&mut self) -> Option<PlatformBudget>;
}

/// Platforms without a budget on top of the device capacity
pub struct NoPlatformBudgetModule;

impl PlatformBudgetModule for NoPlatformBudgetModule {
    fn query(&mut self) -> Option<PlatformBudget> {
        None
    }
}

/// Budget source backed by a closure
pub struct FnPlatformBudgetModule<F: FnMut() -> Option<PlatformBudget>> {
    query: F,
}

impl<F: FnMut() -> Option<PlatformBudget>> FnPlatformBudgetModule<F> {
    pub fn new(query: F) -> Self {
        Self { query }
    }
}

impl<F: FnMut() -> Option<PlatformBudget>> PlatformBudgetModule for FnPlatformBudgetModule<F> {
    fn query(&mut self) -> Option<PlatformBudget> {
        (self.query)()
    }
}

impl<T: PlatformBudgetModule + ?Sized> PlatformBudgetModule for Box<T> {
    fn query(&mut self) -> Option<PlatformBudget> {
        (**self).query()
    }
}
