use core::ptr::null_mut;
use std::sync::MutexGuard;

use super::{get_test_config, PAGE};
use crate::{
    modules::{driver::SimulatedDriverModule, platform_budget::NoPlatformBudgetModule},
    plugin::{self, *},
    util::M,
    Aimdo,
};

/// Installs a simulated context, only one test may use the plugin surface at a time
fn install_test_aimdo(capacity: u64) -> MutexGuard<'static, ()> {
    let guard = plugin::PLUGIN_MUTEX
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    // a previous test might have panicked before uninstalling
    drop(plugin::uninstall().unwrap());

    let aimdo = Aimdo::new(
        Box::new(SimulatedDriverModule::new(capacity)) as DynGpuDriver,
        Box::new(NoPlatformBudgetModule) as DynPlatformBudget,
        0,
        get_test_config(),
    )
    .unwrap();
    plugin::install(aimdo).unwrap();

    guard
}

#[test]
fn test_vbar_api() {
    let _guard = install_test_aimdo(4 * PAGE);

    let vbar = vbar_allocate(100 * M, 0);
    assert!(!vbar.is_null());
    assert_ne!(vbar_get(vbar), 0);

    let mut signature = [0u32; 4];
    let res = unsafe { vbar_fault(vbar, 0, 64 * M, signature.as_mut_ptr()) };
    assert_eq!(res, VBAR_FAULT_SUCCESS);
    assert_eq!(signature[..2], [1, 1]);
    assert_eq!(vbar_loaded_size(vbar), (64 * M) as usize);
    assert_eq!(get_total_vram_usage(), 64 * M);

    vbar_unpin(vbar, 0, 64 * M);
    assert_eq!(vbars_free(PAGE), PAGE);

    // the VBAR shrank, so the tail is out of reach until it is prioritized
    let res = unsafe { vbar_fault(vbar, 0, 4 * PAGE, signature.as_mut_ptr()) };
    assert_eq!(res, VBAR_FAULT_OOM);
    vbar_prioritize(vbar);
    let res = unsafe { vbar_fault(vbar, 0, 4 * PAGE, signature.as_mut_ptr()) };
    assert_eq!(res, VBAR_FAULT_SUCCESS);
    assert_eq!(signature, [1, 2, 1, 1]);

    // pinned pages can not be reclaimed, they go once they are unpinned
    assert_eq!(vbars_free(PAGE), 0);
    assert_eq!(vbar_loaded_size(vbar), (4 * PAGE) as usize);
    vbar_unpin(vbar, 0, 4 * PAGE);
    assert_eq!(vbar_loaded_size(vbar), 0);

    vbar_prioritize(vbar);
    let res = unsafe { vbar_fault(vbar, 0, 4 * PAGE, signature.as_mut_ptr()) };
    assert_eq!(res, VBAR_FAULT_SUCCESS);
    assert_eq!(signature, [2, 3, 2, 2]);
    vbar_unpin(vbar, 0, 4 * PAGE);

    vbar_set_watermark_limit(vbar, 4 * PAGE);
    assert_eq!(vbar_free_memory(vbar, PAGE), 0);
    vbars_reset_watermark_limits();
    assert_eq!(vbar_free_memory(vbar, PAGE), PAGE);

    vbar_deprioritize(vbar);
    aimdo_analyze();
    vbar_free(vbar);
    assert_eq!(get_total_vram_usage(), 0);

    // the handle is dead now
    assert_eq!(vbar_loaded_size(vbar), 0);
    let res = unsafe { vbar_fault(vbar, 0, PAGE, signature.as_mut_ptr()) };
    assert_eq!(res, VBAR_FAULT_ERROR);
    assert_eq!(unsafe { vbar_fault(null_mut(), 0, PAGE, signature.as_mut_ptr()) }, VBAR_FAULT_ERROR);

    aimdo_cleanup();
}

#[test]
fn test_allocator_api() {
    let _guard = install_test_aimdo(4 * PAGE);

    let vbar = vbar_allocate(4 * PAGE, 0);
    let mut signature = [0u32; 4];
    assert_eq!(
        unsafe { vbar_fault(vbar, 0, 4 * PAGE, signature.as_mut_ptr()) },
        VBAR_FAULT_SUCCESS
    );
    vbar_unpin(vbar, 0, 4 * PAGE);

    // memory for the framework is taken from the VBAR
    let ptr = alloc_fn((10 * M) as usize, 0, null_mut());
    assert!(!ptr.is_null());
    assert_eq!(vbar_loaded_size(vbar), (3 * PAGE) as usize);
    free_fn(ptr, (10 * M) as usize, 0, null_mut());
    free_fn(null_mut(), 0, 0, null_mut());

    let buf = vrambuf_create(0, (64 * M) as usize);
    assert!(!buf.is_null());
    assert_eq!(vrambuf_get(buf), buf as u64);
    assert!(vrambuf_grow(buf, (48 * M) as usize));
    assert!(!vrambuf_grow(buf, (65 * M) as usize));
    assert!(!vrambuf_grow(null_mut(), M as usize));
    vrambuf_destroy(buf);
    assert_eq!(vrambuf_get(buf), 0);

    // more than the device has
    assert!(alloc_fn((8 * PAGE) as usize, 0, null_mut()).is_null());

    vbar_free(vbar);
    assert_eq!(get_total_vram_usage(), 0);
    aimdo_cleanup();
}

#[test]
fn test_not_initialized() {
    let _guard = plugin::PLUGIN_MUTEX
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    drop(plugin::uninstall().unwrap());

    assert!(vbar_allocate(PAGE, 0).is_null());
    assert!(alloc_fn(M as usize, 0, null_mut()).is_null());
    assert_eq!(get_total_vram_usage(), 0);
    assert_eq!(vbars_free(PAGE), 0);

    // without the cuda feature there is no driver to initialize
    #[cfg(not(feature = "cuda"))]
    assert!(!aimdo_init(0));

    set_log_level_info();
    set_log_level_debug();
}
