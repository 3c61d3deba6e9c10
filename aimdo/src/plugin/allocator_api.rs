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

use super::call;

/// Allocation hook of the framework's pluggable allocator
#[no_mangle]
pub extern "C" fn alloc_fn(size: usize, device: c_int, _stream: *mut c_void) -> *mut c_void {
    call("alloc_fn", |aimdo| aimdo.alloc(size as u64, device))
        .map_or(null_mut(), |ptr| ptr as usize as *mut c_void)
}

/// Free hook of the framework's pluggable allocator
#[no_mangle]
pub extern "C" fn free_fn(ptr: *mut c_void, _size: usize, _device: c_int, _stream: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    call("free_fn", |aimdo| {
        aimdo.free(ptr as usize as u64);
        Ok(())
    });
}

/// Reserves a growable VRAM buffer of up to `max_size` bytes without committing memory
#[no_mangle]
pub extern "C" fn vrambuf_create(device: c_int, max_size: usize) -> *mut c_void {
    call("vrambuf_create", |aimdo| aimdo.create_buffer(device, max_size as u64))
        .map_or(null_mut(), |ptr| ptr as usize as *mut c_void)
}

/// Makes sure at least `required_size` bytes of the buffer are backed
#[no_mangle]
pub extern "C" fn vrambuf_grow(buf: *mut c_void, required_size: usize) -> bool {
    if buf.is_null() {
        return false;
    }
    call("vrambuf_grow", |aimdo| {
        aimdo.grow_buffer(buf as usize as u64, required_size as u64)
    })
    .is_some()
}

/// Device address of the buffer, 0 for unknown buffers
#[no_mangle]
pub extern "C" fn vrambuf_get(buf: *mut c_void) -> u64 {
    if buf.is_null() {
        return 0;
    }
    call("vrambuf_get", |aimdo| aimdo.buffer_base(buf as usize as u64)).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn vrambuf_destroy(buf: *mut c_void) {
    if buf.is_null() {
        return;
    }
    call("vrambuf_destroy", |aimdo| aimdo.destroy_buffer(buf as usize as u64));
}
