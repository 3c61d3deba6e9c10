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

use core::{ffi::CStr, mem::MaybeUninit, ptr::null_mut};
use std::os::raw::c_char;

use cudarc::driver::sys::{
    cuCtxSetCurrent, cuCtxSynchronize, cuDeviceGet, cuDeviceGetName, cuDevicePrimaryCtxRelease_v2,
    cuDevicePrimaryCtxRetain, cuDeviceTotalMem_v2, cuGetErrorString, cuInit, cuMemAddressFree,
    cuMemAddressReserve, cuMemCreate, cuMemGetInfo_v2, cuMemMap, cuMemRelease, cuMemSetAccess,
    cuMemUnmap, CUcontext, CUdevice, CUdeviceptr, CUmemAccessDesc, CUmemAccess_flags,
    CUmemAllocationProp, CUmemAllocationType, CUmemGenericAllocationHandle, CUmemLocationType,
    CUresult,
};
use log::debug;

use super::{DevicePtr, GpuDriverModule, PhysicalHandle};
use crate::error::DriverError;

fn check_cu(res: CUresult, label: &str) -> Result<(), DriverError> {
    match res {
        CUresult::CUDA_SUCCESS => Ok(()),
        CUresult::CUDA_ERROR_OUT_OF_MEMORY => Err(DriverError::OutOfMemory),
        err => {
            let mut desc: *const c_char = core::ptr::null();
            let desc = if unsafe { cuGetErrorString(err, &mut desc) } == CUresult::CUDA_SUCCESS
                && !desc.is_null()
            {
                unsafe { CStr::from_ptr(desc) }.to_string_lossy().into_owned()
            } else {
                "<FATAL - CANNOT PARSE CUDA ERROR CODE>".to_string()
            };
            debug!("CUDA API FAILED : {} : {}", label, desc);
            Err(DriverError::Failed(err as i32))
        }
    }
}

/// Driver module on top of the CUDA driver API virtual memory management
pub struct CudaDriverModule {
    device: CUdevice,
    context: CUcontext,
}

// the primary context may be used from any thread
unsafe impl Send for CudaDriverModule {}

impl CudaDriverModule {
    /// Initializes the driver and makes the primary context of `device_id` current
    pub fn new(device_id: i32) -> Result<Self, DriverError> {
        check_cu(unsafe { cuInit(0) }, "cuInit")?;

        let mut device: CUdevice = 0;
        check_cu(unsafe { cuDeviceGet(&mut device, device_id) }, "cuDeviceGet")?;

        let mut context: CUcontext = null_mut();
        check_cu(
            unsafe { cuDevicePrimaryCtxRetain(&mut context, device) },
            "cuDevicePrimaryCtxRetain",
        )?;
        if let Err(err) = check_cu(unsafe { cuCtxSetCurrent(context) }, "cuCtxSetCurrent") {
            let _ = check_cu(
                unsafe { cuDevicePrimaryCtxRelease_v2(device) },
                "cuDevicePrimaryCtxRelease",
            );
            return Err(err);
        }

        Ok(Self { device, context })
    }

    fn allocation_prop(device: i32) -> CUmemAllocationProp {
        let mut prop: CUmemAllocationProp = unsafe { MaybeUninit::zeroed().assume_init() };
        prop.type_ = CUmemAllocationType::CU_MEM_ALLOCATION_TYPE_PINNED;
        prop.location.type_ = CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE;
        prop.location.id = device;
        prop
    }

    fn access_desc(device: i32) -> CUmemAccessDesc {
        let mut desc: CUmemAccessDesc = unsafe { MaybeUninit::zeroed().assume_init() };
        desc.location.type_ = CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE;
        desc.location.id = device;
        desc.flags = CUmemAccess_flags::CU_MEM_ACCESS_FLAGS_PROT_READWRITE;
        desc
    }
}

impl Drop for CudaDriverModule {
    fn drop(&mut self) {
        if !self.context.is_null() {
            let _ = check_cu(
                unsafe { cuDevicePrimaryCtxRelease_v2(self.device) },
                "cuDevicePrimaryCtxRelease",
            );
        }
    }
}

impl GpuDriverModule for CudaDriverModule {
    fn device_total_mem(&mut self, device: i32) -> Result<u64, DriverError> {
        let mut dev: CUdevice = 0;
        check_cu(unsafe { cuDeviceGet(&mut dev, device) }, "cuDeviceGet")?;

        let mut bytes: usize = 0;
        check_cu(unsafe { cuDeviceTotalMem_v2(&mut bytes, dev) }, "cuDeviceTotalMem")?;
        Ok(bytes as u64)
    }

    fn device_name(&mut self, device: i32) -> Option<String> {
        let mut dev: CUdevice = 0;
        check_cu(unsafe { cuDeviceGet(&mut dev, device) }, "cuDeviceGet").ok()?;

        let mut name = [0 as c_char; 256];
        check_cu(
            unsafe { cuDeviceGetName(name.as_mut_ptr(), name.len() as i32, dev) },
            "cuDeviceGetName",
        )
        .ok()?;
        let name = unsafe { CStr::from_ptr(name.as_ptr()) };
        Some(name.to_string_lossy().into_owned())
    }

    fn mem_get_info(&mut self) -> Result<(u64, u64), DriverError> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        check_cu(unsafe { cuMemGetInfo_v2(&mut free, &mut total) }, "cuMemGetInfo")?;
        Ok((free as u64, total as u64))
    }

    fn reserve_address(&mut self, size: u64) -> Result<DevicePtr, DriverError> {
        let mut ptr: CUdeviceptr = 0;
        check_cu(
            unsafe { cuMemAddressReserve(&mut ptr, size as usize, 0, 0, 0) },
            "cuMemAddressReserve",
        )?;
        Ok(ptr as DevicePtr)
    }

    fn free_address(&mut self, ptr: DevicePtr, size: u64) -> Result<(), DriverError> {
        check_cu(
            unsafe { cuMemAddressFree(ptr as CUdeviceptr, size as usize) },
            "cuMemAddressFree",
        )
    }

    fn create_physical(&mut self, size: u64, device: i32) -> Result<PhysicalHandle, DriverError> {
        let prop = Self::allocation_prop(device);
        let mut handle: CUmemGenericAllocationHandle = 0;
        check_cu(
            unsafe { cuMemCreate(&mut handle, size as usize, &prop, 0) },
            "cuMemCreate",
        )?;
        PhysicalHandle::new(handle as u64).ok_or(DriverError::Failed(-1))
    }

    fn map(&mut self, vaddr: DevicePtr, size: u64, handle: PhysicalHandle) -> Result<(), DriverError> {
        check_cu(
            unsafe {
                cuMemMap(
                    vaddr as CUdeviceptr,
                    size as usize,
                    0,
                    handle.get() as CUmemGenericAllocationHandle,
                    0,
                )
            },
            "cuMemMap",
        )
    }

    fn set_access(&mut self, vaddr: DevicePtr, size: u64, device: i32) -> Result<(), DriverError> {
        let desc = Self::access_desc(device);
        check_cu(
            unsafe { cuMemSetAccess(vaddr as CUdeviceptr, size as usize, &desc, 1) },
            "cuMemSetAccess",
        )
    }

    fn unmap(&mut self, vaddr: DevicePtr, size: u64) -> Result<(), DriverError> {
        check_cu(
            unsafe { cuMemUnmap(vaddr as CUdeviceptr, size as usize) },
            "cuMemUnmap",
        )
    }

    fn release_physical(&mut self, handle: PhysicalHandle) -> Result<(), DriverError> {
        check_cu(
            unsafe { cuMemRelease(handle.get() as CUmemGenericAllocationHandle) },
            "cuMemRelease",
        )
    }

    fn synchronize(&mut self) -> Result<(), DriverError> {
        check_cu(unsafe { cuCtxSynchronize() }, "cuCtxSynchronize")
    }
}
