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

use std::collections::{BTreeMap, HashMap};

use log::trace;

use super::{DevicePtr, GpuDriverModule, PhysicalHandle};
use crate::error::DriverError;

/// Status code used for invalid arguments (same value as `CUDA_ERROR_INVALID_VALUE`)
pub const SIMULATED_INVALID_VALUE: i32 = 1;

/// Start of the simulated device address space
const ADDRESS_SPACE_BASE: DevicePtr = 0x7f00_0000_0000;

/// Calls for which a failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedCall {
    ReserveAddress,
    CreatePhysical,
    Map,
    SetAccess,
}

struct PhysicalAllocation {
    size: u64,
    mapped: bool,
    released: bool,
}

/// A driver that keeps all of its state on the host.
///
/// No device memory is touched, but physical capacity, mappings and
/// reservations are tracked exactly, so running out of memory behaves like
/// on a real device.
pub struct SimulatedDriverModule {
    capacity: u64,

    /// memory used by other processes
    foreign_usage: u64,

    physical_in_use: u64,
    physical: HashMap<u64, PhysicalAllocation>,
    next_handle: u64,

    /// start -> (size, handle)
    mappings: BTreeMap<DevicePtr, (u64, PhysicalHandle)>,

    /// start -> size
    reservations: BTreeMap<DevicePtr, u64>,
    reserved_bytes: u64,
    address_space_limit: u64,
    next_address: DevicePtr,

    sync_count: usize,
    injected_failure: Option<(SimulatedCall, DriverError)>,
}

impl SimulatedDriverModule {
    /// Creates a new device with `capacity` bytes of physical memory
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            foreign_usage: 0,
            physical_in_use: 0,
            physical: HashMap::new(),
            next_handle: 1,
            mappings: BTreeMap::new(),
            reservations: BTreeMap::new(),
            reserved_bytes: 0,
            address_space_limit: u64::MAX - ADDRESS_SPACE_BASE,
            next_address: ADDRESS_SPACE_BASE,
            sync_count: 0,
            injected_failure: None,
        }
    }

    /// Limits the total amount of virtual address space that can be reserved
    pub fn with_address_space_limit(mut self, limit: u64) -> Self {
        self.address_space_limit = limit;
        self
    }

    /// Simulates memory that is used by other processes
    pub fn set_foreign_usage(&mut self, bytes: u64) {
        self.foreign_usage = bytes;
    }

    /// The next call of type `call` fails with `err`
    pub fn fail_next(&mut self, call: SimulatedCall, err: DriverError) {
        self.injected_failure = Some((call, err));
    }

    pub fn physical_in_use(&self) -> u64 {
        self.physical_in_use
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.mappings.values().map(|(size, _)| *size).sum()
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    pub fn live_physical_handles(&self) -> usize {
        self.physical.len()
    }

    /// How many times the device was synchronized
    pub fn sync_count(&self) -> usize {
        self.sync_count
    }

    pub fn is_mapped(&self, vaddr: DevicePtr) -> bool {
        self.mappings.contains_key(&vaddr)
    }

    fn take_failure(&mut self, call: SimulatedCall) -> Result<(), DriverError> {
        match self.injected_failure {
            Some((injected, err)) if injected == call => {
                self.injected_failure = None;
                Err(err)
            }
            _ => Ok(()),
        }
    }

    fn is_reserved(&self, vaddr: DevicePtr, size: u64) -> bool {
        match self.reservations.range(..=vaddr).next_back() {
            Some((start, len)) => vaddr + size <= start + len,
            None => false,
        }
    }

    fn overlaps_mapping(&self, vaddr: DevicePtr, size: u64) -> bool {
        if let Some((start, (len, _))) = self.mappings.range(..=vaddr).next_back() {
            if start + len > vaddr {
                return true;
            }
        }
        self.mappings.range(vaddr..vaddr + size).next().is_some()
    }

    fn free_physical(&mut self, handle: u64) {
        if let Some(alloc) = self.physical.remove(&handle) {
            self.physical_in_use -= alloc.size;
        }
    }
}

impl GpuDriverModule for SimulatedDriverModule {
    fn device_total_mem(&mut self, _device: i32) -> Result<u64, DriverError> {
        Ok(self.capacity)
    }

    fn device_name(&mut self, _device: i32) -> Option<String> {
        Some("Simulated GPU".to_string())
    }

    fn mem_get_info(&mut self) -> Result<(u64, u64), DriverError> {
        let free = self
            .capacity
            .saturating_sub(self.physical_in_use)
            .saturating_sub(self.foreign_usage);
        Ok((free, self.capacity))
    }

    fn reserve_address(&mut self, size: u64) -> Result<DevicePtr, DriverError> {
        self.take_failure(SimulatedCall::ReserveAddress)?;

        if size == 0 {
            return Err(DriverError::Failed(SIMULATED_INVALID_VALUE));
        }
        if self.reserved_bytes + size > self.address_space_limit {
            return Err(DriverError::OutOfMemory);
        }

        let ptr = self.next_address;
        self.next_address += size;
        self.reservations.insert(ptr, size);
        self.reserved_bytes += size;

        trace!("Reserved {} bytes at {:#x}", size, ptr);
        Ok(ptr)
    }

    fn free_address(&mut self, ptr: DevicePtr, size: u64) -> Result<(), DriverError> {
        match self.reservations.get(&ptr) {
            Some(len) if *len == size => {}
            _ => return Err(DriverError::Failed(SIMULATED_INVALID_VALUE)),
        }
        if self.overlaps_mapping(ptr, size) {
            // the range still has mappings
            return Err(DriverError::Failed(SIMULATED_INVALID_VALUE));
        }

        self.reservations.remove(&ptr);
        self.reserved_bytes -= size;
        Ok(())
    }

    fn create_physical(&mut self, size: u64, _device: i32) -> Result<PhysicalHandle, DriverError> {
        self.take_failure(SimulatedCall::CreatePhysical)?;

        if self.physical_in_use + self.foreign_usage + size > self.capacity {
            return Err(DriverError::OutOfMemory);
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        self.physical.insert(
            handle,
            PhysicalAllocation {
                size,
                mapped: false,
                released: false,
            },
        );
        self.physical_in_use += size;

        PhysicalHandle::new(handle).ok_or(DriverError::Failed(SIMULATED_INVALID_VALUE))
    }

    fn map(&mut self, vaddr: DevicePtr, size: u64, handle: PhysicalHandle) -> Result<(), DriverError> {
        self.take_failure(SimulatedCall::Map)?;

        if !self.is_reserved(vaddr, size) || self.overlaps_mapping(vaddr, size) {
            return Err(DriverError::Failed(SIMULATED_INVALID_VALUE));
        }
        match self.physical.get_mut(&handle.get()) {
            Some(alloc) if alloc.size == size && !alloc.mapped && !alloc.released => {
                alloc.mapped = true;
            }
            _ => return Err(DriverError::Failed(SIMULATED_INVALID_VALUE)),
        }

        self.mappings.insert(vaddr, (size, handle));
        Ok(())
    }

    fn set_access(&mut self, vaddr: DevicePtr, size: u64, _device: i32) -> Result<(), DriverError> {
        self.take_failure(SimulatedCall::SetAccess)?;

        match self.mappings.get(&vaddr) {
            Some((len, _)) if *len == size => Ok(()),
            _ => Err(DriverError::Failed(SIMULATED_INVALID_VALUE)),
        }
    }

    fn unmap(&mut self, vaddr: DevicePtr, size: u64) -> Result<(), DriverError> {
        let handle = match self.mappings.get(&vaddr) {
            Some((len, handle)) if *len == size => *handle,
            _ => return Err(DriverError::Failed(SIMULATED_INVALID_VALUE)),
        };
        self.mappings.remove(&vaddr);

        let release = match self.physical.get_mut(&handle.get()) {
            Some(alloc) => {
                alloc.mapped = false;
                alloc.released
            }
            None => false,
        };
        if release {
            self.free_physical(handle.get());
        }
        Ok(())
    }

    fn release_physical(&mut self, handle: PhysicalHandle) -> Result<(), DriverError> {
        let mapped = match self.physical.get_mut(&handle.get()) {
            Some(alloc) if !alloc.released => {
                alloc.released = true;
                alloc.mapped
            }
            _ => return Err(DriverError::Failed(SIMULATED_INVALID_VALUE)),
        };

        // memory is returned once the last mapping is gone
        if !mapped {
            self.free_physical(handle.get());
        }
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), DriverError> {
        self.sync_count += 1;
        Ok(())
    }
}
