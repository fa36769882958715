//! Thread-local scratch allocations
//!
//! Short-lived pixel strips are allocated constantly on the read and write
//! paths. Small blocks come out of a per-thread pool of recycled buffers;
//! anything above the threshold goes straight to the heap and is freed on
//! drop.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

/// Largest block the per-thread pool will retain
#[cfg(windows)]
pub const ALLOCA_THRESHOLD: usize = 8 * 1024;
#[cfg(not(windows))]
pub const ALLOCA_THRESHOLD: usize = 512 * 1024;

const POOL_SLOTS: usize = 8;

thread_local! {
    static POOL: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

/// A zero-filled scratch buffer, recycled on drop when small enough
pub struct ScratchBuf {
    buf: Vec<u8>,
    len: usize,
}

impl Deref for ScratchBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl DerefMut for ScratchBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl Drop for ScratchBuf {
    fn drop(&mut self) {
        if self.buf.capacity() <= ALLOCA_THRESHOLD {
            let buf = std::mem::take(&mut self.buf);
            POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                if pool.len() < POOL_SLOTS {
                    pool.push(buf);
                }
            });
        }
    }
}

/// Allocates `size` zeroed scratch bytes
pub fn alloc(size: usize) -> ScratchBuf {
    if size <= ALLOCA_THRESHOLD {
        let reused = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            let idx = pool.iter().position(|b| b.capacity() >= size);
            idx.map(|i| pool.swap_remove(i))
        });
        if let Some(mut buf) = reused {
            buf.clear();
            buf.resize(size, 0);
            return ScratchBuf { buf, len: size };
        }
    }
    ScratchBuf {
        buf: vec![0u8; size],
        len: size,
    }
}
