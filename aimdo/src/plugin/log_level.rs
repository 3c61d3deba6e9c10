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

use std::sync::Once;

use env_logger::{Builder, Env};
use log::LevelFilter;

static LOGGER: Once = Once::new();

/// Sets up `env_logger` for the plugin, if the host did not install a logger already.
///
/// Starts at debug level, the host lowers it with one of the `set_log_level_*` functions.
pub(crate) fn init_logger() {
    LOGGER.call_once(|| {
        let res = Builder::from_env(Env::default().default_filter_or("trace"))
            .format_module_path(false)
            .try_init();
        if res.is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    });
}

#[no_mangle]
pub extern "C" fn set_log_level_none() {
    log::set_max_level(LevelFilter::Off);
}

/// There is no level above error, critical messages are logged as errors
#[no_mangle]
pub extern "C" fn set_log_level_critical() {
    log::set_max_level(LevelFilter::Error);
}

#[no_mangle]
pub extern "C" fn set_log_level_error() {
    log::set_max_level(LevelFilter::Error);
}

#[no_mangle]
pub extern "C" fn set_log_level_warning() {
    log::set_max_level(LevelFilter::Warn);
}

#[no_mangle]
pub extern "C" fn set_log_level_info() {
    log::set_max_level(LevelFilter::Info);
}

#[no_mangle]
pub extern "C" fn set_log_level_debug() {
    log::set_max_level(LevelFilter::Debug);
}

#[no_mangle]
pub extern "C" fn set_log_level_verbose() {
    log::set_max_level(LevelFilter::Trace);
}
