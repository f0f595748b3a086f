#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

use cfg_if::cfg_if;

mod allocator;
mod error;
mod handle;
mod ledger;
mod metrics;
mod pool;
mod strategy;

pub use allocator::{LedgerDump, PoolAllocator};
pub use error::{Error, Result};
pub use handle::Handle;
pub use ledger::BlockInfo;
pub use metrics::{Metrics, Stats};
pub use pool::Pool;
pub use strategy::Strategy;

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use alloc::alloc::{AllocError, Allocator, Global};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator, Global};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
