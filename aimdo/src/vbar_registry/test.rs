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

use core::time::Duration;

use crate::{
    budget_tracker::BudgetTracker,
    error::{AimdoError, DriverError},
    modules::{
        driver::{SimulatedCall, SimulatedDriverModule},
        platform_budget::NoPlatformBudgetModule,
    },
    util::M,
    vram_pool::VramPool,
};

use super::{VbarHandle, VbarRegistry};

const PAGE: u64 = 32 * M;

type TestPool = VramPool<SimulatedDriverModule, NoPlatformBudgetModule>;

fn get_test_registry(capacity: u64) -> (VbarRegistry, TestPool) {
    let _ = env_logger::builder().is_test(true).try_init();

    let pool = VramPool::new(
        SimulatedDriverModule::new(capacity),
        BudgetTracker::new(capacity, 0, NoPlatformBudgetModule, 0, Duration::ZERO),
    );
    (VbarRegistry::new(PAGE), pool)
}

/// Allocates a VBAR of `pages` pages and makes all of them resident (unpinned)
fn allocate_resident(registry: &mut VbarRegistry, pool: &mut TestPool, pages: u64) -> VbarHandle {
    let vbar = registry.allocate(pool, pages * PAGE, 0).unwrap();
    registry.fault(pool, vbar, 0, pages * PAGE).unwrap();
    registry.unpin(pool, vbar, 0, pages * PAGE).unwrap();
    vbar
}

fn resident_pages(registry: &VbarRegistry, vbar: VbarHandle) -> Vec<usize> {
    (0..registry.nr_pages(vbar).unwrap())
        .filter(|page_nr| registry.is_resident(vbar, *page_nr).unwrap())
        .collect()
}

#[test]
fn test_fault_scenario() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = registry.allocate(&mut pool, 100 * M, 0).unwrap();
    assert_eq!(registry.nr_pages(vbar).unwrap(), 4);
    assert_eq!(registry.watermark(vbar).unwrap(), 4);
    assert_eq!(pool.driver().reserved_bytes(), 4 * PAGE);

    assert_eq!(registry.fault(&mut pool, vbar, 0, 64 * M).unwrap(), vec![1, 1]);
    assert!(registry.is_pinned(vbar, 0).unwrap());
    assert!(registry.is_pinned(vbar, 1).unwrap());
    assert!(!registry.is_resident(vbar, 2).unwrap());
    assert_eq!(registry.loaded_size(vbar).unwrap(), 64 * M);

    // nothing was evicted, so the backing did not change
    assert_eq!(registry.fault(&mut pool, vbar, 0, 64 * M).unwrap(), vec![1, 1]);
    assert_eq!(pool.budget().resident_usage(), 64 * M);
    assert_eq!(pool.driver().physical_in_use(), 64 * M);
}

#[test]
fn test_fault_serial_changes_after_eviction() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = allocate_resident(&mut registry, &mut pool, 2);
    assert_eq!(registry.evict_global(&mut pool, PAGE), PAGE);
    registry.prioritize(vbar).unwrap();

    assert_eq!(registry.fault(&mut pool, vbar, 0, 2 * PAGE).unwrap(), vec![1, 2]);
}

#[test]
fn test_fault_above_watermark() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = allocate_resident(&mut registry, &mut pool, 4);
    assert_eq!(registry.free_memory(&mut pool, vbar, PAGE).unwrap(), PAGE);
    assert_eq!(registry.watermark(vbar).unwrap(), 3);

    let physical = pool.driver().physical_in_use();
    assert_eq!(
        registry.fault(&mut pool, vbar, 2 * PAGE, 2 * PAGE),
        Err(AimdoError::OutOfMemory)
    );
    // out of bounds requests are above the watermark as well
    assert_eq!(
        registry.fault(&mut pool, vbar, u64::MAX - 1, 2),
        Err(AimdoError::OutOfMemory)
    );
    assert_eq!(pool.driver().physical_in_use(), physical);

    registry.prioritize(vbar).unwrap();
    assert_eq!(registry.watermark(vbar).unwrap(), 4);
    assert_eq!(registry.fault(&mut pool, vbar, 2 * PAGE, 2 * PAGE).unwrap(), vec![1, 2]);
}

#[test]
fn test_fault_reclaims_from_lower_priority() {
    let (mut registry, mut pool) = get_test_registry(4 * PAGE);

    let low = allocate_resident(&mut registry, &mut pool, 4);
    let high = registry.allocate(&mut pool, 4 * PAGE, 0).unwrap();
    let syncs = pool.driver().sync_count();

    assert_eq!(registry.fault(&mut pool, high, 0, 2 * PAGE).unwrap(), vec![1, 1]);

    // only as much as needed is taken from the tail of the lower priority VBAR
    assert_eq!(resident_pages(&registry, low), vec![0, 1]);
    assert_eq!(registry.watermark(low).unwrap(), 2);
    assert_eq!(registry.watermark(high).unwrap(), 4);
    assert_eq!(pool.driver().sync_count(), syncs + 1);
}

#[test]
fn test_fault_cancelled_by_own_watermark() {
    let (mut registry, mut pool) = get_test_registry(4 * PAGE);
    pool.driver_mut().set_foreign_usage(2 * PAGE);

    let vbar = registry.allocate(&mut pool, 4 * PAGE, 0).unwrap();
    assert_eq!(
        registry.fault(&mut pool, vbar, 0, 3 * PAGE),
        Err(AimdoError::OutOfMemory)
    );

    // the VBAR had to shrink itself, what was committed stays resident
    assert_eq!(registry.watermark(vbar).unwrap(), 2);
    assert_eq!(resident_pages(&registry, vbar), vec![0, 1]);
    assert!(!registry.is_pinned(vbar, 0).unwrap());
}

#[test]
fn test_fault_driver_error() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = registry.allocate(&mut pool, 4 * PAGE, 0).unwrap();
    registry.fault(&mut pool, vbar, 0, PAGE).unwrap();

    pool.driver_mut()
        .fail_next(SimulatedCall::Map, DriverError::Failed(700));
    assert_eq!(
        registry.fault(&mut pool, vbar, 0, 3 * PAGE),
        Err(AimdoError::Driver(DriverError::Failed(700)))
    );

    // no retry for errors other than OOM
    assert_eq!(resident_pages(&registry, vbar), vec![0]);
    assert_eq!(pool.driver().live_physical_handles(), 1);
}

#[test]
fn test_fault_retry_still_out_of_memory() {
    let (mut registry, mut pool) = get_test_registry(2 * PAGE);

    // pinned pages can not be reclaimed
    let low = registry.allocate(&mut pool, 2 * PAGE, 0).unwrap();
    registry.fault(&mut pool, low, 0, 2 * PAGE).unwrap();
    let high = registry.allocate(&mut pool, 2 * PAGE, 0).unwrap();
    registry.set_watermark_limit(high, 2 * PAGE).unwrap();

    assert_eq!(
        registry.fault(&mut pool, high, 0, PAGE),
        Err(AimdoError::OutOfMemory)
    );

    // the pinned pages are still resident, but the watermark passed them
    assert_eq!(registry.watermark(low).unwrap(), 0);
    assert_eq!(resident_pages(&registry, low), vec![0, 1]);
    assert_eq!(registry.watermark(high).unwrap(), 2);
    assert_eq!(resident_pages(&registry, high), vec![]);
    assert_eq!(pool.driver().live_physical_handles(), 2);
}

#[test]
fn test_fault_retry_driver_error() {
    let (mut registry, mut pool) = get_test_registry(2 * PAGE);

    let low = allocate_resident(&mut registry, &mut pool, 2);
    let high = registry.allocate(&mut pool, 2 * PAGE, 0).unwrap();

    // the first commit runs out of memory before reaching the access setup
    pool.driver_mut()
        .fail_next(SimulatedCall::SetAccess, DriverError::Failed(7));
    assert_eq!(
        registry.fault(&mut pool, high, 0, PAGE),
        Err(AimdoError::Driver(DriverError::Failed(7)))
    );

    assert_eq!(resident_pages(&registry, low), vec![0]);
    assert_eq!(resident_pages(&registry, high), vec![]);
    assert_eq!(pool.driver().live_physical_handles(), 1);
    assert_eq!(pool.budget().resident_usage(), PAGE);
}

#[test]
fn test_evict_global_order() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    // allocated last means highest priority
    let c = allocate_resident(&mut registry, &mut pool, 4);
    let b = allocate_resident(&mut registry, &mut pool, 4);
    let a = allocate_resident(&mut registry, &mut pool, 4);

    assert_eq!(registry.evict_global(&mut pool, 2 * PAGE), 2 * PAGE);
    assert_eq!(resident_pages(&registry, c), vec![0, 1]);
    assert_eq!(resident_pages(&registry, b), vec![0, 1, 2, 3]);

    assert_eq!(registry.evict_global(&mut pool, 3 * PAGE), 3 * PAGE);
    assert_eq!(resident_pages(&registry, c), vec![]);
    assert_eq!(resident_pages(&registry, b), vec![0, 1, 2]);
    assert_eq!(resident_pages(&registry, a), vec![0, 1, 2, 3]);

    assert_eq!(registry.evict_global(&mut pool, 5 * PAGE), 5 * PAGE);
    assert_eq!(resident_pages(&registry, b), vec![]);
    assert_eq!(resident_pages(&registry, a), vec![0, 1]);

    // more than is left
    assert_eq!(registry.evict_global(&mut pool, 8 * PAGE), 2 * PAGE);
    assert_eq!(pool.budget().resident_usage(), 0);
    assert_eq!(pool.driver().physical_in_use(), 0);
}

#[test]
fn test_evict_global_prioritized() {
    // two VBARs of 60% of the capacity each
    let (mut registry, mut pool) = get_test_registry(10 * PAGE);

    let first = allocate_resident(&mut registry, &mut pool, 6);
    let second = registry.allocate(&mut pool, 6 * PAGE, 0).unwrap();
    registry.prioritize(second).unwrap();
    registry.fault(&mut pool, second, 0, 4 * PAGE).unwrap();
    registry.unpin(&mut pool, second, 0, 4 * PAGE).unwrap();

    // the device is full now
    assert_eq!(registry.loaded_size(first).unwrap(), 6 * PAGE);
    assert_eq!(registry.evict_global(&mut pool, 6 * PAGE), 6 * PAGE);

    assert_eq!(registry.loaded_size(first).unwrap(), 0);
    assert_eq!(registry.loaded_size(second).unwrap(), 4 * PAGE);
}

#[test]
fn test_evict_global_limits_and_pins() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let b = allocate_resident(&mut registry, &mut pool, 4);
    let a = allocate_resident(&mut registry, &mut pool, 4);
    registry.deprioritize(a).unwrap();
    registry.set_watermark_limit(a, PAGE + 1).unwrap();
    registry.fault(&mut pool, b, 3 * PAGE, PAGE).unwrap();

    assert_eq!(registry.evict_global(&mut pool, 8 * PAGE), 5 * PAGE);
    assert_eq!(registry.watermark(a).unwrap(), 2);
    assert_eq!(resident_pages(&registry, a), vec![0, 1]);

    // the pinned page stays, but the watermark moved past it
    assert_eq!(registry.watermark(b).unwrap(), 0);
    assert_eq!(resident_pages(&registry, b), vec![3]);

    let syncs = pool.driver().sync_count();
    registry.unpin(&mut pool, b, 3 * PAGE, PAGE).unwrap();
    assert_eq!(resident_pages(&registry, b), vec![]);
    assert_eq!(pool.driver().sync_count(), syncs + 1);

    registry.reset_all_watermark_limits();
    assert_eq!(registry.watermark_limit(a).unwrap(), 0);
    assert_eq!(registry.evict_global(&mut pool, PAGE), PAGE);
    assert_eq!(resident_pages(&registry, a), vec![0]);
}

#[test]
fn test_zero_sized_requests_are_noops() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = allocate_resident(&mut registry, &mut pool, 2);
    let syncs = pool.driver().sync_count();

    assert_eq!(registry.evict_global(&mut pool, 0), 0);
    assert_eq!(registry.free_memory(&mut pool, vbar, 0).unwrap(), 0);

    assert_eq!(pool.driver().sync_count(), syncs);
    assert_eq!(registry.loaded_size(vbar).unwrap(), 2 * PAGE);
    assert_eq!(registry.watermark(vbar).unwrap(), 2);
}

#[test]
fn test_free_memory_skips_pinned_pages() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = allocate_resident(&mut registry, &mut pool, 4);
    registry.fault(&mut pool, vbar, 2 * PAGE, 2 * PAGE).unwrap();

    assert_eq!(registry.free_memory(&mut pool, vbar, 2 * PAGE).unwrap(), 2 * PAGE);
    assert_eq!(registry.watermark(vbar).unwrap(), 0);
    assert_eq!(resident_pages(&registry, vbar), vec![2, 3]);

    // the pages are above the watermark now and get evicted after a barrier
    let syncs = pool.driver().sync_count();
    registry.unpin(&mut pool, vbar, 2 * PAGE, 2 * PAGE).unwrap();
    assert_eq!(pool.driver().sync_count(), syncs + 1);
    assert_eq!(registry.loaded_size(vbar).unwrap(), 0);
    assert_eq!(pool.driver().physical_in_use(), 0);
}

#[test]
fn test_unpin_below_watermark_keeps_pages() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = registry.allocate(&mut pool, 4 * PAGE, 0).unwrap();
    registry.fault(&mut pool, vbar, 0, 2 * PAGE).unwrap();
    let syncs = pool.driver().sync_count();

    registry.unpin(&mut pool, vbar, 0, 2 * PAGE).unwrap();
    assert!(!registry.is_pinned(vbar, 0).unwrap());
    assert_eq!(resident_pages(&registry, vbar), vec![0, 1]);
    assert_eq!(pool.driver().sync_count(), syncs);
}

#[test]
fn test_free() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let other = allocate_resident(&mut registry, &mut pool, 1);
    let vbar = registry.allocate(&mut pool, 4 * PAGE, 0).unwrap();
    registry.fault(&mut pool, vbar, 0, 3 * PAGE).unwrap();

    let syncs = pool.driver().sync_count();
    registry.free(&mut pool, vbar).unwrap();
    assert_eq!(pool.driver().sync_count(), syncs + 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(pool.budget().resident_usage(), PAGE);
    assert_eq!(pool.driver().reserved_bytes(), PAGE);
    assert_eq!(registry.handles().collect::<Vec<_>>(), vec![other]);

    assert_eq!(registry.free(&mut pool, vbar), Err(AimdoError::InvalidHandle));
    assert_eq!(registry.loaded_size(vbar), Err(AimdoError::InvalidHandle));

    // a reused slot does not revive the old handle
    let new = registry.allocate(&mut pool, PAGE, 0).unwrap();
    assert_ne!(new, vbar);
    assert_eq!(registry.prioritize(vbar), Err(AimdoError::InvalidHandle));

    registry.free_all(&mut pool);
    assert!(registry.is_empty());
    assert_eq!(pool.driver().physical_in_use(), 0);
    assert_eq!(pool.driver().reserved_bytes(), 0);
}

#[test]
fn test_prioritize_and_deprioritize() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let a = allocate_resident(&mut registry, &mut pool, 2);
    let b = allocate_resident(&mut registry, &mut pool, 2);
    assert_eq!(registry.handles().collect::<Vec<_>>(), vec![b, a]);

    registry.free_memory(&mut pool, b, PAGE).unwrap();
    registry.deprioritize(b).unwrap();
    assert_eq!(registry.handles().collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(registry.watermark(b).unwrap(), 1);

    registry.prioritize(b).unwrap();
    assert_eq!(registry.handles().collect::<Vec<_>>(), vec![b, a]);
    assert_eq!(registry.watermark(b).unwrap(), 2);
}

#[test]
fn test_set_watermark_limit() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = allocate_resident(&mut registry, &mut pool, 4);
    registry.free_memory(&mut pool, vbar, 4 * PAGE).unwrap();
    assert_eq!(registry.watermark(vbar).unwrap(), 0);

    registry.set_watermark_limit(vbar, 2 * PAGE).unwrap();
    assert_eq!(registry.watermark_limit(vbar).unwrap(), 2);
    assert_eq!(registry.watermark(vbar).unwrap(), 2);

    registry.set_watermark_limit(vbar, 100 * PAGE).unwrap();
    assert_eq!(registry.watermark_limit(vbar).unwrap(), 4);
    assert_eq!(registry.watermark(vbar).unwrap(), 4);
    assert_eq!(registry.free_memory(&mut pool, vbar, PAGE).unwrap(), 0);
}

#[test]
fn test_allocate_is_capped_by_capacity() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = registry.allocate(&mut pool, 10 * 1024 * M, 0).unwrap();
    assert_eq!(registry.nr_pages(vbar).unwrap(), 32);
    assert_eq!(pool.driver().reserved_bytes(), 1024 * M);
}

#[test]
fn test_allocate_without_address_space() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut pool = VramPool::new(
        SimulatedDriverModule::new(1024 * M).with_address_space_limit(PAGE),
        BudgetTracker::new(1024 * M, 0, NoPlatformBudgetModule, 0, Duration::ZERO),
    );
    let mut registry = VbarRegistry::new(PAGE);

    assert_eq!(
        registry.allocate(&mut pool, 2 * PAGE, 0),
        Err(AimdoError::AddressSpace(DriverError::OutOfMemory))
    );
    assert!(registry.is_empty());
    assert!(registry.allocate(&mut pool, PAGE, 0).is_ok());
}

#[test]
fn test_analyze() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);
    assert_eq!(registry.analyze(), None);

    let vbar = registry.allocate(&mut pool, 4 * PAGE, 0).unwrap();
    registry.fault(&mut pool, vbar, 0, 2 * PAGE).unwrap();

    let report = registry.analyze().unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.resident_bytes, 2 * PAGE);
    assert_eq!(report.vbars.len(), 1);
    assert_eq!(report.vbars[0].pinned, 2);
    assert_eq!(report.vbars[0].watermark, 4);

    // nothing changed since the last audit
    assert_eq!(registry.analyze(), None);

    registry.unpin(&mut pool, vbar, 0, 2 * PAGE).unwrap();
    assert!(registry.analyze().is_some());
}

#[test]
fn test_raw_handle() {
    let (mut registry, mut pool) = get_test_registry(1024 * M);

    let vbar = registry.allocate(&mut pool, PAGE, 0).unwrap();
    assert_ne!(vbar.to_raw(), 0);
    assert_eq!(VbarHandle::from_raw(vbar.to_raw()), Some(vbar));
    assert_eq!(VbarHandle::from_raw(0), None);
}
