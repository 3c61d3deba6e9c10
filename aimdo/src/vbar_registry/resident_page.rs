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

use crate::modules::driver::PhysicalHandle;

/// State of a single page of a VBAR
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ResidentPage {
    /// physical backing, `None` if the page is not resident
    pub(crate) handle: Option<PhysicalHandle>,

    /// in use by in-flight device work, must not be evicted
    pub(crate) pinned: bool,

    /// incremented every time the page gets fresh physical backing
    pub(crate) serial: u32,
}

impl ResidentPage {
    #[inline]
    pub(crate) fn is_resident(&self) -> bool {
        self.handle.is_some()
    }
}
