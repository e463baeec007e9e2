pub mod balancer;
pub mod manager;

pub use balancer::*;
pub use manager::*;
