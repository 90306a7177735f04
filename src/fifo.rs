//----------------------------------------------------------------------------------------------
// Module fifo
// Packet buffer pool and receive/transmit queues
// The receive indication may run in interrupt context while the main loop pops the same
// queues, so every queue operation is guarded by a mutex held only across the O(1) relink

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::codec;

//----------------------------------------------------------------------------------------------
// XcpBuffer

/// One fixed capacity packet buffer
/// Owned by exactly one of free pool, receive queue, transmit queue or a pending
/// stimulation slot at any time
#[derive(Debug)]
pub struct XcpBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl XcpBuffer {
    fn new(capacity: usize) -> XcpBuffer {
        XcpBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// The filled part of the buffer
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Reset the logical length to zero
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Fill the buffer from a slice, replacing any previous content
    /// The slice must fit the capacity, callers check against the configured maximum DTO size
    pub fn fill(&mut self, data: &[u8]) {
        self.data[..data.len()].copy_from_slice(data);
        self.len = data.len();
    }

    /// Append a byte at the current logical length and advance it
    pub fn append_u8(&mut self, value: u8) {
        codec::set_u8(&mut self.data, self.len, value);
        self.len += 1;
    }

    /// Append a little-endian u16 at the current logical length and advance it
    pub fn append_u16(&mut self, value: u16) {
        codec::set_u16(&mut self.data, self.len, value);
        self.len += 2;
    }

    /// Append a little-endian u32 at the current logical length and advance it
    pub fn append_u32(&mut self, value: u32) {
        codec::set_u32(&mut self.data, self.len, value);
        self.len += 4;
    }

    /// Append a byte slice at the current logical length and advance it
    pub fn append_slice(&mut self, data: &[u8]) {
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    /// Remaining writable capacity
    pub fn space_left(&self) -> usize {
        self.data.len() - self.len
    }
}

//----------------------------------------------------------------------------------------------
// Fifo

/// A queue of packet buffers with O(1) locked get/put/put_front
#[derive(Debug)]
pub struct Fifo {
    name: &'static str,
    queue: Mutex<VecDeque<XcpBuffer>>,
}

impl Fifo {
    pub fn new(name: &'static str) -> Fifo {
        Fifo {
            name,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Pop the front buffer, None if empty
    pub fn get(&self) -> Option<XcpBuffer> {
        self.queue.lock().pop_front()
    }

    /// Push a buffer to the back
    pub fn put(&self, buffer: XcpBuffer) {
        self.queue.lock().push_back(buffer);
    }

    /// Push a buffer back to the front, used to requeue after a failed transmit
    /// so ordering relative to other queued packets is preserved
    pub fn put_front(&self, buffer: XcpBuffer) {
        self.queue.lock().push_front(buffer);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

//----------------------------------------------------------------------------------------------
// BufferPool

/// The free pool, itself a Fifo pre-loaded with all buffers at init
/// Pool exhaustion is backpressure, not an error: callers drop the receive indication or
/// stall the transmit until the next tick
#[derive(Debug)]
pub struct BufferPool {
    free: Fifo,
    capacity: usize,
}

impl BufferPool {
    /// Seed a pool with `count` buffers of `size` bytes each
    /// Buffers are allocated once here, never afterwards
    pub fn new(count: usize, size: usize) -> BufferPool {
        let free = Fifo::new("free");
        for _ in 0..count {
            free.put(XcpBuffer::new(size));
        }
        BufferPool { free, capacity: count }
    }

    /// Take a buffer from the free pool, None when exhausted
    pub fn get(&self) -> Option<XcpBuffer> {
        self.free.get()
    }

    /// Reset a buffer and return it to the free pool
    pub fn free(&self, mut buffer: XcpBuffer) {
        buffer.clear();
        self.free.put(buffer);
    }

    /// Number of buffers currently in the free pool
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of buffers owned by the pool
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

//----------------------------------------------------------------------------------------------
// XcpQueues

/// The shared queue set: one free pool feeding the receive and transmit queues
/// Cloned as Arc into the transport receive path, which may run in interrupt context
#[derive(Debug)]
pub struct XcpQueues {
    pub pool: BufferPool,
    pub rx: Fifo,
    pub tx: Fifo,
}

impl XcpQueues {
    pub fn new(count: usize, size: usize) -> Arc<XcpQueues> {
        Arc::new(XcpQueues {
            pool: BufferPool::new(count, size),
            rx: Fifo::new("rx"),
            tx: Fifo::new("tx"),
        })
    }

    /// Buffers reachable from free pool, rx queue and tx queue
    /// Equals the pool capacity whenever no buffer is checked out or parked in a
    /// stimulation slot
    pub fn reachable(&self) -> usize {
        self.pool.available() + self.rx.len() + self.tx.len()
    }
}

//----------------------------------------------------------------------------------------------
//----------------------------------------------------------------------------------------------
// Test module
