//! Userspace ring channel
//!
//! Byte-bounded multi-producer, single-reader channel with the same accounting
//! as the kernel BPF ring buffer: every record costs an 8-byte header plus its
//! payload rounded up to 8 bytes, and a producer that does not fit gets
//! [`RING_FULL`] back and bumps the drop counter. Producers never block.
//!
//! Backs the synthetic event source, so the collector sees kernel-like
//! overflow behaviour without loading a probe program.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Per-record header, as in `BPF_RINGBUF_HDR_SZ`
pub const RECORD_HEADER: usize = 8;

/// Error code returned to a producer when the ring has no room (`-EAGAIN`)
pub const RING_FULL: i64 = -(libc::EAGAIN as i64);

/// Bytes a record of `len` payload bytes occupies in the ring
pub const fn record_footprint(len: usize) -> usize {
    RECORD_HEADER + len.div_ceil(8) * 8
}

#[derive(Debug, Default)]
struct RingState {
    records: VecDeque<Vec<u8>>,
    used: usize,
}

#[derive(Debug)]
pub struct RingChannel {
    capacity: usize,
    state: Mutex<RingState>,
    dropped: AtomicU64,
    readable: Notify,
}

impl RingChannel {
    /// `capacity` must be a power of two (checked by `CaptureConfig::validate`)
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            capacity,
            state: Mutex::new(RingState::default()),
            dropped: AtomicU64::new(0),
            readable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue one record or drop it
    ///
    /// # Errors
    /// Returns [`RING_FULL`] when the record does not fit
    pub fn try_output(&self, record: &[u8]) -> Result<(), i64> {
        let footprint = record_footprint(record.len());
        {
            let mut state = self.lock();
            if state.used + footprint > self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(RING_FULL);
            }
            state.used += footprint;
            state.records.push_back(record.to_vec());
        }
        self.readable.notify_one();
        Ok(())
    }

    /// Records rejected because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.lock().records.len()
    }

    /// Lazily yield the records buffered at the time of the call
    ///
    /// Finite: records produced while iterating are left for the next drain.
    pub fn drain(&self) -> Drain<'_> {
        let remaining = self.pending();
        Drain { ring: self, remaining }
    }

    /// Wait until a record was produced since the last wake-up, or `timeout`
    ///
    /// Returns `true` if woken by a producer.
    pub async fn wait_readable(&self, timeout: Duration) -> bool {
        if self.pending() > 0 {
            return true;
        }
        tokio::time::timeout(timeout, self.readable.notified()).await.is_ok()
    }
}

pub struct Drain<'a> {
    ring: &'a RingChannel,
    remaining: usize,
}

impl Iterator for Drain<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.remaining == 0 {
            return None;
        }
        let mut state = self.ring.lock();
        let record = state.records.pop_front()?;
        state.used -= record_footprint(record.len());
        self.remaining -= 1;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdebug_common::EVENT_SIZE;
    use std::sync::Arc;

    #[test]
    fn test_footprint_matches_kernel_accounting() {
        assert_eq!(record_footprint(EVENT_SIZE), 464);
        assert_eq!(record_footprint(1), 16);
        assert_eq!(record_footprint(0), 8);
    }

    #[test]
    fn test_full_ring_drops_exactly_one_per_miss() {
        let ring = RingChannel::new(2048);
        let record = vec![0u8; EVENT_SIZE];
        let results: Vec<_> = (0..10).map(|_| ring.try_output(&record)).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4, "2048 bytes hold 4 records");
        assert!(results.iter().skip(4).all(|r| *r == Err(RING_FULL)));
        assert_eq!(ring.dropped(), 6);
    }

    #[test]
    fn test_drain_is_finite_and_frees_space() {
        let ring = RingChannel::new(4096);
        for i in 0..3u8 {
            ring.try_output(&[i; 8]).unwrap();
        }
        let mut drain = ring.drain();
        assert_eq!(drain.next(), Some(vec![0u8; 8]));
        ring.try_output(&[9; 8]).unwrap();
        assert_eq!(drain.count(), 2, "records added mid-drain wait for the next call");
        assert_eq!(ring.drain().collect::<Vec<_>>(), vec![vec![9u8; 8]]);
        assert_eq!(ring.pending(), 0);
    }

    #[test]
    fn test_parallel_producers_lose_nothing_that_was_reserved() {
        let ring = Arc::new(RingChannel::new(1 << 20));
        let handles: Vec<_> = (0..4u8)
            .map(|p| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    (0..200).filter(|_| ring.try_output(&[p; EVENT_SIZE]).is_ok()).count()
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let drained = ring.drain().count();
        assert_eq!(drained, accepted);
        assert_eq!(accepted as u64 + ring.dropped(), 800);
    }

    #[tokio::test]
    async fn test_wait_readable_times_out_when_empty() {
        let ring = RingChannel::new(4096);
        assert!(!ring.wait_readable(Duration::from_millis(10)).await);
        ring.try_output(&[1; 8]).unwrap();
        assert!(ring.wait_readable(Duration::from_millis(10)).await);
    }
}
