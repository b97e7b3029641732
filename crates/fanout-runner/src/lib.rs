pub mod memo;
pub mod runner;

pub use memo::FetchMemo;
pub use runner::{FanOutRunner, RunProgress};
