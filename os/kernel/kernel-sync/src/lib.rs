//! # Kernel synchronization primitives
//!
//! The memory and storage layers only need one primitive: a busy-waiting
//! [`SpinLock`] whose guard doubles as proof of ownership. Functions that
//! require a lock to be held take the guard (or `&mut` to the protected
//! value) instead of querying a "held by current thread" flag at runtime.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
