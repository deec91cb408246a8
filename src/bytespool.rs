//! Process-wide byte-buffer pool for the RPC hot path.
//!
//! Frame encoding allocates one scratch buffer per call; recycling those
//! buffers keeps the steady-state allocation rate near zero. The pool is a
//! single mutex-guarded free list shared by the whole process.

use parking_lot::Mutex;

/// Initial capacity handed out when the pool is empty.
const DEFAULT_CAPACITY: usize = 512;

/// Buffers beyond this count are dropped on `put` instead of retained.
const MAX_POOLED_BUFFERS: usize = 64;

/// Buffers that grew past this size are not worth keeping around.
const MAX_RETAINED_CAPACITY: usize = 1024 * 1024;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// Take a cleared buffer from the pool, allocating if the pool is empty.
///
/// The returned buffer has length zero but keeps whatever capacity it had in
/// a previous life. Previously stored data is not zeroed.
pub fn get() -> Vec<u8> {
    match POOL.lock().pop() {
        Some(buffer) => buffer,
        None => Vec::with_capacity(DEFAULT_CAPACITY),
    }
}

/// Take a buffer guaranteed to hold at least `capacity` bytes without
/// reallocating.
pub fn get_with_capacity(capacity: usize) -> Vec<u8> {
    let mut buffer = get();
    if buffer.capacity() < capacity {
        buffer.reserve(capacity - buffer.len());
    }
    buffer
}

/// Return a buffer to the pool. Callers must not use the buffer afterwards.
pub fn put(mut buffer: Vec<u8>) {
    if buffer.capacity() == 0 || buffer.capacity() > MAX_RETAINED_CAPACITY {
        return;
    }
    buffer.clear();

    let mut pool = POOL.lock();
    if pool.len() < MAX_POOLED_BUFFERS {
        pool.push(buffer);
    }
}
