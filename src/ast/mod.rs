//! Abstract syntax tree definitions.

pub mod types;

pub use types::*;
