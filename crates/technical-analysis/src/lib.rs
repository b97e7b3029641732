pub mod indicators;
pub mod screeners;

pub use indicators::*;
pub use screeners::*;
