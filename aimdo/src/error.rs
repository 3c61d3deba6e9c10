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

use thiserror::Error;

/// Error reported by a [`GpuDriverModule`](crate::modules::driver::GpuDriverModule) call
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// Physical device memory is exhausted, reclaiming memory may help
    #[error("out of device memory")]
    OutOfMemory,

    /// Any other driver failure, carrying the driver's status code
    #[error("driver call failed (code: {0})")]
    Failed(i32),
}

impl DriverError {
    pub fn is_oom(&self) -> bool {
        matches!(self, DriverError::OutOfMemory)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AimdoError {
    /// Host bookkeeping memory could not be allocated
    #[error("host out of memory")]
    HostOutOfMemory,

    /// Virtual address space could not be reserved
    #[error("could not reserve virtual address space: {0}")]
    AddressSpace(DriverError),

    /// Physical VRAM is exhausted even after reclaiming memory
    #[error("out of VRAM")]
    OutOfMemory,

    #[error(transparent)]
    Driver(DriverError),

    /// The handle does not refer to a live VBAR or buffer
    #[error("invalid handle")]
    InvalidHandle,

    #[error("requested {requested} bytes, but only {max} bytes are reserved")]
    ExceedsReservation { requested: u64, max: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// No context is installed for the plugin surface
    #[error("aimdo is not initialized")]
    NotInitialized,

    #[error("aimdo is already initialized")]
    AlreadyInitialized,

    /// The plugin context is currently used by another caller
    #[error("aimdo is used concurrently")]
    Busy,
}

impl From<DriverError> for AimdoError {
    fn from(value: DriverError) -> Self {
        match value {
            DriverError::OutOfMemory => AimdoError::OutOfMemory,
            err => AimdoError::Driver(err),
        }
    }
}

impl From<std::collections::TryReserveError> for AimdoError {
    fn from(_: std::collections::TryReserveError) -> Self {
        AimdoError::HostOutOfMemory
    }
}
