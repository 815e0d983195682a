pub mod listener;
pub mod worker;

pub use worker::WorkerPool;
