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

use core::{
    ffi::{c_int, c_void},
    ptr::null_mut,
};

use log::{debug, error};

use crate::{error::AimdoError, vbar_registry::VbarHandle};

use super::{call, ACCESS_POINT};

pub const VBAR_FAULT_SUCCESS: c_int = 0;

/// The range is above the watermark or no memory could be reclaimed
pub const VBAR_FAULT_OOM: c_int = 1;

pub const VBAR_FAULT_ERROR: c_int = 2;

/// VBAR handles cross the ABI as opaque non null pointers
fn to_handle(vbar: *mut c_void) -> Result<VbarHandle, AimdoError> {
    VbarHandle::from_raw(vbar as usize as u64).ok_or(AimdoError::InvalidHandle)
}

fn to_ptr(handle: VbarHandle) -> *mut c_void {
    handle.to_raw() as usize as *mut c_void
}

#[no_mangle]
pub extern "C" fn vbar_allocate(size: u64, device: c_int) -> *mut c_void {
    call("vbar_allocate", |aimdo| aimdo.allocate_vbar(size, device))
        .map(to_ptr)
        .unwrap_or(null_mut())
}

/// Base address of the VBAR, 0 for invalid handles
#[no_mangle]
pub extern "C" fn vbar_get(vbar: *mut c_void) -> u64 {
    call("vbar_get", |aimdo| aimdo.vbar_base(to_handle(vbar)?)).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn vbar_prioritize(vbar: *mut c_void) {
    call("vbar_prioritize", |aimdo| aimdo.prioritize(to_handle(vbar)?));
}

#[no_mangle]
pub extern "C" fn vbar_deprioritize(vbar: *mut c_void) {
    call("vbar_deprioritize", |aimdo| aimdo.deprioritize(to_handle(vbar)?));
}

#[no_mangle]
pub extern "C" fn vbar_set_watermark_limit(vbar: *mut c_void, size: u64) {
    call("vbar_set_watermark_limit", |aimdo| {
        aimdo.set_watermark_limit(to_handle(vbar)?, size)
    });
}

#[no_mangle]
pub extern "C" fn vbars_reset_watermark_limits() {
    call("vbars_reset_watermark_limits", |aimdo| {
        aimdo.reset_watermark_limits();
        Ok(())
    });
}

/// Makes `[offset, offset + size)` of the VBAR resident and pins it.
///
/// Returns one of `VBAR_FAULT_SUCCESS`, `VBAR_FAULT_OOM` or `VBAR_FAULT_ERROR`.
/// On success the serial of every page in the range is written to `signature`.
///
/// # Safety
///
/// `signature` has to be valid for writes of one `u32` per page the range touches.
#[no_mangle]
pub unsafe extern "C" fn vbar_fault(
    vbar: *mut c_void,
    offset: u64,
    size: u64,
    signature: *mut u32,
) -> c_int {
    if signature.is_null() {
        error!("vbar_fault: no signature buffer");
        return VBAR_FAULT_ERROR;
    }

    let res = ACCESS_POINT.with(|aimdo| aimdo.fault(to_handle(vbar)?, offset, size));

    match res {
        Ok(serials) => {
            // the caller guarantees room for every page of the range
            unsafe { core::ptr::copy_nonoverlapping(serials.as_ptr(), signature, serials.len()) };
            VBAR_FAULT_SUCCESS
        }
        Err(AimdoError::OutOfMemory) => VBAR_FAULT_OOM,
        Err(err) => {
            error!("vbar_fault: {}", err);
            VBAR_FAULT_ERROR
        }
    }
}

#[no_mangle]
pub extern "C" fn vbar_unpin(vbar: *mut c_void, offset: u64, size: u64) {
    call("vbar_unpin", |aimdo| aimdo.unpin(to_handle(vbar)?, offset, size));
}

#[no_mangle]
pub extern "C" fn vbar_free(vbar: *mut c_void) {
    call("vbar_free", |aimdo| aimdo.free_vbar(to_handle(vbar)?));
}

/// Bytes of the VBAR that currently have physical backing
#[no_mangle]
pub extern "C" fn vbar_loaded_size(vbar: *mut c_void) -> usize {
    call("vbar_loaded_size", |aimdo| aimdo.loaded_size(to_handle(vbar)?))
        .map_or(0, |size| size as usize)
}

/// Shrinks the VBAR from its tail, returns the number of bytes freed
#[no_mangle]
pub extern "C" fn vbar_free_memory(vbar: *mut c_void, size: u64) -> u64 {
    call("vbar_free_memory", |aimdo| {
        aimdo.free_vbar_memory(to_handle(vbar)?, size)
    })
    .unwrap_or(0)
}

/// Reclaims `size` bytes from the VBARs with the lowest priority,
/// returns the number of bytes freed
#[no_mangle]
pub extern "C" fn vbars_free(size: u64) -> u64 {
    let freed = call("vbars_free", |aimdo| Ok(aimdo.evict_global(size))).unwrap_or(0);
    debug!("vbars_free: freed {} of {} bytes", freed, size);
    freed
}
