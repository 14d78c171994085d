pub mod catalog;
pub mod core;
pub mod delivery;
pub mod observability;
pub mod storage;
pub mod sync;
