pub mod control;
pub mod energy;
pub mod measurement;

pub use control::*;
pub use energy::*;
pub use measurement::*;
