pub mod cache;
pub mod channel;
pub mod dram;
pub mod mshr;
pub mod operable;
pub mod request;

#[cfg(test)]
mod unit_tests;

pub use cache::{Cache, CacheBlock, CacheConfig, CacheStats};
pub use channel::{link, ChannelConfig, ChannelRef, MemChannel};
pub use dram::{DramChannelStats, DramConfig, DramController};
pub use mshr::{MshrEntry, MshrTable};
pub use operable::{Cycle, Operable};
pub use request::{AccessKind, MemRequest, MemResponse};
