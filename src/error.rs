//! Error types.

use core::{error, fmt};

/// Result alias defaulting to this crate's only recoverable error.
pub type Result<T, E = OutOfMemory> = core::result::Result<T, E>;

/// The pool has no free pages left.
///
/// This is the only recoverable failure in this crate: the caller propagates
/// it upward (typically as a failed system call reporting out-of-memory) and
/// may retry after other owners release pages. Every other misuse of the pool
/// indicates memory corruption somewhere and panics instead of returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of physical pages")
    }
}
impl error::Error for OutOfMemory {}
