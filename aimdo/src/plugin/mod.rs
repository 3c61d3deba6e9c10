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

//! The C ABI of aimdo.
//!
//! The host framework loads the `cdylib` and resolves the allocator hooks
//! (`alloc_fn`, `free_fn`) and the VBAR API by name. All functions operate on
//! a single process wide context that is created with `aimdo_init`
//! (or [`install`] from Rust) and torn down with `aimdo_cleanup`.
//!
//! Failures never cross the ABI as panics, they are logged and reported as
//! null pointers, `false` or status codes.

mod access_point;
mod allocator_api;
mod control;
mod log_level;
mod vbar_api;

pub use allocator_api::*;
pub use control::*;
pub use log_level::*;
pub use vbar_api::*;

use log::{debug, error};

use crate::{
    error::AimdoError,
    modules::{driver::GpuDriverModule, platform_budget::PlatformBudgetModule},
    Aimdo,
};
use access_point::AimdoAccessPoint;

pub type DynGpuDriver = Box<dyn GpuDriverModule + Send>;
pub type DynPlatformBudget = Box<dyn PlatformBudgetModule + Send>;

/// Context type used by the C ABI, with a driver and budget source selected at runtime
pub type DynAimdo = Aimdo<DynGpuDriver, DynPlatformBudget>;

static ACCESS_POINT: AimdoAccessPoint = AimdoAccessPoint::empty();

/// For test environment only one test may use the access point at a time
#[cfg(test)]
pub(crate) static PLUGIN_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Makes `aimdo` the context of the C ABI.
///
/// Fails if a context is installed already.
pub fn install(aimdo: DynAimdo) -> Result<(), AimdoError> {
    log_level::init_logger();
    ACCESS_POINT.set(aimdo)
}

/// Removes the context of the C ABI and returns it.
///
/// Dropping the returned context frees all of its memory.
pub fn uninstall() -> Result<Option<DynAimdo>, AimdoError> {
    ACCESS_POINT.unset()
}

/// Runs `f` on the installed context, logging any failure
fn call<R>(func: &str, f: impl FnOnce(&mut DynAimdo) -> Result<R, AimdoError>) -> Option<R> {
    match ACCESS_POINT.with(f) {
        Ok(res) => Some(res),
        Err(err @ AimdoError::OutOfMemory) => {
            debug!("{}: {}", func, err);
            None
        }
        Err(err) => {
            error!("{}: {}", func, err);
            None
        }
    }
}
