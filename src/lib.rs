//! The Segfit allocator crate.
//!
//! For getting started:
//! - Check out the crate's [README](https://docs.rs/segfit)
//! - Read the [`Segfit`] and [`SegfitCell`] structures.
//!
//! Your first step will be `Segfit::new(...)` over a [`HeapProvider`], then [`Segfit::init`].
//! Wrapping it in a [`SegfitCell`] yields a type which implements
//! [`GlobalAlloc`](core::alloc::GlobalAlloc) and
//! [`Allocator`](allocator_api2::alloc::Allocator).

#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]

#[cfg(test)]
mod test_utils;
pub(crate) mod ptr_utils;

pub mod base;
pub mod cell;
pub mod heap;

pub use base::{BlockInfo, Blocks, CheckError, CheckOptions, Segfit};
pub use cell::SegfitCell;
pub use heap::{ClaimedHeap, HeapExhausted, HeapProvider};
#[cfg(all(feature = "system-backed", any(unix, windows)))]
pub use heap::{SysHeap, VmHeap};

#[cfg(feature = "counters")]
pub use base::Counters;
