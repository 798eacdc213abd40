//! Buffer pool (spec component C3, §4.2).
//!
//! Two queues of fixed buffer descriptors, handed in by the host, that
//! partition ownership between the driver and the host. Every descriptor is
//! at all times in exactly one of `free`, `ready`, or host-owned (`OUT` set)
//! - never in two places, never in none (spec invariant 2).

use std::collections::VecDeque;

/// Per-buffer header (spec "Buffer descriptor" in §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferHeader {
    pub sequence: u64,
    /// Presentation timestamp, nanoseconds.
    pub pts: u64,
    pub dts_offset: i64,
}

/// A sub-range `(offset, size)` within a descriptor's payload, both in
/// bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chunk {
    pub offset: usize,
    pub size: usize,
}

/// A host-owned buffer descriptor (spec §3). `payload` is the region the
/// driver fills (capture) or reads from (playback); `OUT` is tracked
/// separately by the pool rather than as a field here, since the
/// container-membership discipline (free / ready / host) already encodes
/// it - a descriptor the pool is not holding is by definition `OUT`.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub id: u64,
    pub payload: Vec<u8>,
    pub chunk: Chunk,
    pub stride: usize,
    pub header: BufferHeader,
}

impl BufferDescriptor {
    pub fn new(id: u64, capacity: usize, stride: usize) -> Self {
        BufferDescriptor { id, payload: vec![0u8; capacity], chunk: Chunk::default(), stride, header: BufferHeader::default() }
    }

    pub fn capacity(&self) -> usize {
        self.payload.len()
    }
}

/// Error returned by a pool operation that found its queue empty (spec §7:
/// not an error condition in the `Result` sense, drives the host handshake
/// instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEmpty {
    NoData,
    NoSpace,
}

/// The two descriptor queues plus the callbacks that hand descriptors back
/// to the host (spec §4.2, §6.2).
pub struct BufferPool {
    free: VecDeque<BufferDescriptor>,
    ready: VecDeque<BufferDescriptor>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool { free: VecDeque::new(), ready: VecDeque::new() }
    }

    /// Reset on engine start/reconfigure (spec §4.2): for playback every
    /// descriptor is handed to the host (`OUT`, nothing left here); for
    /// capture every descriptor goes onto `free`.
    pub fn reset(&mut self, descriptors: Vec<BufferDescriptor>, direction: crate::Direction) {
        self.free.clear();
        self.ready.clear();
        match direction {
            crate::Direction::Capture => self.free.extend(descriptors),
            crate::Direction::Playback => { /* all descriptors start OUT - host owns them */ }
        }
    }

    /// Playback: pop the head of `ready`, or `NoData` if empty.
    pub fn take_ready(&mut self) -> Result<BufferDescriptor, PoolEmpty> {
        self.ready.pop_front().ok_or(PoolEmpty::NoData)
    }

    /// Playback: push back a partially-drained head buffer that should be
    /// consumed again next round.
    pub fn push_front_ready(&mut self, d: BufferDescriptor) {
        self.ready.push_front(d);
    }

    /// Submit a freshly filled/queued descriptor into `ready` (host →
    /// engine for playback, engine → `ready` overflow path for capture,
    /// spec §4.5.3 step 2's "append to ready if host slot is occupied").
    pub fn push_ready(&mut self, d: BufferDescriptor) {
        self.ready.push_back(d);
    }

    pub fn ready_is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Capture: pop the head of `free`, or `NoSpace` if empty.
    pub fn take_free(&mut self) -> Result<BufferDescriptor, PoolEmpty> {
        self.free.pop_front().ok_or(PoolEmpty::NoSpace)
    }

    /// Playback: host handed a fresh descriptor back for a future transfer.
    pub fn submit_free(&mut self, d: BufferDescriptor) {
        self.free.push_back(d);
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;

    #[test]
    fn descriptor_starts_in_exactly_one_container() {
        let mut pool = BufferPool::new();
        let descriptors: Vec<_> = (0..4).map(|i| BufferDescriptor::new(i, 1024, 4)).collect();
        pool.reset(descriptors, Direction::Capture);
        assert_eq!(pool.free_len(), 4);
        assert_eq!(pool.ready_len(), 0);

        let d = pool.take_free().unwrap();
        assert_eq!(pool.free_len(), 3);
        pool.push_ready(d);
        assert_eq!(pool.ready_len(), 1);
    }

    #[test]
    fn take_ready_on_empty_pool_is_no_data() {
        let mut pool = BufferPool::new();
        assert_eq!(pool.take_ready().unwrap_err(), PoolEmpty::NoData);
    }

    #[test]
    fn take_free_on_empty_pool_is_no_space() {
        let mut pool = BufferPool::new();
        assert_eq!(pool.take_free().unwrap_err(), PoolEmpty::NoSpace);
    }

    #[test]
    fn playback_reset_leaves_all_descriptors_with_the_host() {
        let mut pool = BufferPool::new();
        let descriptors: Vec<_> = (0..4).map(|i| BufferDescriptor::new(i, 1024, 4)).collect();
        pool.reset(descriptors, Direction::Playback);
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.ready_len(), 0);
    }
}
