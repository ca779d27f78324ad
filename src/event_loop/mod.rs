//! Promises and the cooperative event loop.

pub mod promise;
pub mod scheduler;

pub use promise::{Promise, PromiseState};
