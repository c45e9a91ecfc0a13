// # Range Store Implementations
//
// This module provides implementations of the RangeStore trait for
// different persistence strategies.

mod tables;

pub mod file;
pub mod memory;

pub use file::{FileRangeStore, FileRangeStoreFactory};
pub use memory::{MemoryRangeStore, MemoryRangeStoreFactory};
pub(crate) use tables::RangeTables;
