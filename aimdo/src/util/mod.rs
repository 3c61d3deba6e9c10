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

pub(crate) mod priority_list;

pub(crate) const K: u64 = 1024;
pub(crate) const M: u64 = K * K;

/// Rounds `num` up to a multiple of `multiple`, `None` if that does not fit into a `u64`
#[inline]
pub(crate) const fn round_up_to_nearest(num: u64, multiple: u64) -> Option<u64> {
    div_ceil(num, multiple).checked_mul(multiple)
}

/// efficient way to calculate: ceil(x / y)
#[inline]
pub(crate) const fn div_ceil(num: u64, div: u64) -> u64 {
    num / div + (num % div != 0) as u64
}
