pub mod batching;
pub mod range_planner;
