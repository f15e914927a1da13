//! Physical page allocation with per-page reference counting.
//!
//! This crate is the physical-memory half of a copy-on-write fork
//! implementation: a fixed range of 4096-byte pages is seeded into a pool at
//! boot, and every live page carries a count of the virtual-memory mappings
//! that own it. Fork shares a page by [retaining] it; tearing down a mapping
//! (process exit, write-fault privatization, fork-failure cleanup) [releases]
//! it. A page whose last owner releases it returns to the pool; a page that
//! drops to exactly one owner is reported as newly exclusive so the
//! virtual-memory layer can restore write permission on the surviving
//! mapping.
//!
//! The pool never touches page tables. It has no back-reference from a
//! physical page to the mappings that reference it, so it only signals the
//! shared-to-exclusive transition; acting on it is the caller's job.
//!
//! [retaining]: KPagePool::retain
//! [releases]: KPagePool::release

#![no_std]

pub mod error;
pub mod pool;
pub mod sync;

pub use error::OutOfMemory;
pub use pool::{ALLOC_FILL, FREE_FILL, KPagePool, PAGE_SIZE, PageAddr, PageSpan, ReleaseOutcome};
