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

use core::ffi::c_int;

use log::{error, info, warn};

use super::{call, log_level::init_logger, uninstall};

/// Creates the process wide context for `device`.
///
/// Only available with the `cuda` feature, returns `false` otherwise.
#[no_mangle]
pub extern "C" fn aimdo_init(device: c_int) -> bool {
    init_logger();

    #[cfg(feature = "cuda")]
    {
        use super::install;
        use crate::{
            modules::{driver::CudaDriverModule, platform_budget::NoPlatformBudgetModule},
            Aimdo, AimdoConfig,
        };

        let driver = match CudaDriverModule::new(device) {
            Ok(driver) => driver,
            Err(err) => {
                error!("aimdo_init: could not initialize CUDA device {}: {}", device, err);
                return false;
            }
        };
        let aimdo = match Aimdo::new(
            Box::new(driver) as super::DynGpuDriver,
            Box::new(NoPlatformBudgetModule) as super::DynPlatformBudget,
            device,
            AimdoConfig::default(),
        ) {
            Ok(aimdo) => aimdo,
            Err(err) => {
                error!("aimdo_init: {}", err);
                return false;
            }
        };

        match install(aimdo) {
            Ok(()) => true,
            Err(err) => {
                warn!("aimdo_init: {}", err);
                false
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        error!(
            "aimdo_init: built without a device driver, cannot initialize device {}",
            device
        );
        false
    }
}

/// Frees everything that was allocated through the context and destroys it
#[no_mangle]
pub extern "C" fn aimdo_cleanup() {
    match uninstall() {
        Ok(Some(aimdo)) => {
            info!("aimdo_cleanup: releasing device {}", aimdo.device());
            drop(aimdo);
        }
        Ok(None) => warn!("aimdo_cleanup: aimdo is not initialized"),
        Err(err) => error!("aimdo_cleanup: {}", err),
    }
}

/// Logs the memory usage, all VBARs and all buffers
#[no_mangle]
pub extern "C" fn aimdo_analyze() {
    call("aimdo_analyze", |aimdo| {
        aimdo.analyze();
        Ok(())
    });
}

/// Physical memory committed through aimdo
#[no_mangle]
pub extern "C" fn get_total_vram_usage() -> u64 {
    call("get_total_vram_usage", |aimdo| Ok(aimdo.total_vram_usage())).unwrap_or(0)
}
