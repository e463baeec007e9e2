pub mod traits;
pub mod memory;

pub use traits::*;
pub use memory::*;
