pub mod driver;
pub mod platform_budget;
