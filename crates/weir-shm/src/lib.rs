//! Shared-memory arenas and process-shared synchronization for weir.
//!
//! This crate is the platform layer under the weir dataflow substrate. It
//! provides:
//!
//! - [`Arena`]: a named, growable POSIX shared-memory segment with a
//!   directory of named objects and portable offset-based [`Handle`]s.
//! - [`sync::Mutex`], [`sync::Condvar`], [`sync::SharableMutex`]: `repr(C)`
//!   futex-based primitives embeddable in arena memory and shared across
//!   processes.
//! - [`futex`]: the raw syscall wrappers the primitives are built on.
//!
//! Linux-only: process-shared waiting is done directly on futex words with
//! no `FUTEX_PRIVATE_FLAG`.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod error;
pub mod futex;
pub mod map;
pub mod sync;

pub use arena::{
    ARENA_RESERVE, Arena, Handle, MAX_NAMED_OBJECTS, MAX_OBJECT_NAME, MIN_ARENA_SIZE,
};
pub use error::ArenaError;
pub use sync::{Condvar, Mutex, SharableMutex};
