pub mod device;
pub mod reading;

pub use device::*;
pub use reading::*;
