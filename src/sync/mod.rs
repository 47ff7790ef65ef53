//! Reentrant spin lock guarding a connection's shared mutable state.
//!
//! A reader task and a writer task may both touch the same connection state;
//! code running under the lock may re-enter it (extension hooks calling back
//! into the connection) without deadlocking itself.

mod reentrant;

pub use reentrant::{ReentrantLock, ReentrantMutex, ReentrantMutexGuard, ThreadOwner};
