mod aimdo;
mod aimdo_config;
mod budget_tracker;
mod error;
mod util;
mod vbar_registry;
mod vram_buffer;
mod vram_pool;

#[cfg(test)]
mod test;

pub use crate::aimdo::{Aimdo, VramStats};
pub use aimdo_config::{
    AimdoConfig, BUDGET_POLL_INTERVAL, MIN_ALLOC_SIZE, PLATFORM_BUDGET_HEADROOM, VBAR_PAGE_SIZE,
    VRAM_CHUNK_SIZE, VRAM_HEADROOM,
};
pub use budget_tracker::BudgetTracker;
pub use error::{AimdoError, DriverError};
pub use vbar_registry::{AuditReport, VbarAudit, VbarHandle, VbarRegistry};
pub use vram_buffer::VramAllocator;
pub mod modules;
pub mod plugin;
