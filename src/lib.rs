pub mod approval;
pub mod audit;
pub mod config;
pub mod queue;
pub mod runtime;
pub mod shared;
pub mod work;
