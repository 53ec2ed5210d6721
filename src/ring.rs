//! Bounded single-producer/single-consumer byte ring coupling the
//! real-time receiver to the analyzer/writer thread.
//!
//! The data path is lock-free: two monotonically increasing atomic
//! cursors, no reserved slack byte, so `used + free == capacity` holds
//! exactly and overflow accounting is precise. A mutex/condvar pair is
//! used only to let the consumer sleep on an empty buffer.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::warn;

use crate::ts::TS_SIZE;

/// Interval between overflow log lines.
const OVERFLOW_REPORT_DELTA: Duration = Duration::from_secs(5);

struct OverflowLog {
    count:       u64,
    bytes:       u64,
    last_report: Option<Instant>,
}

/// Contract: exactly one thread calls [`put`](RingBuffer::put) and
/// exactly one (other) thread calls [`get`](RingBuffer::get) /
/// [`del`](RingBuffer::del).
pub struct RingBuffer {
    /// `capacity + margin` bytes; the slack past `capacity` mirrors
    /// wrapped head bytes so reads stay contiguous.
    storage:        UnsafeCell<Box<[u8]>>,
    capacity:       usize,
    margin:         usize,
    /// Total bytes ever written (producer-owned).
    head:           AtomicU64,
    /// Total bytes ever consumed (consumer-owned).
    tail:           AtomicU64,
    lock:           Mutex<()>,
    ready:          Condvar,
    get_timeout:    Duration,
    overflow_total: AtomicU64,
    overflow_log:   Mutex<OverflowLog>,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// A ring with the default margin of two TS packets.
    pub fn new(capacity: usize) -> Self {
        Self::with_margin(capacity, 2 * TS_SIZE)
    }

    pub fn with_margin(capacity: usize, margin: usize) -> Self {
        assert!(capacity >= margin, "ring capacity below margin");
        Self {
            storage: UnsafeCell::new(vec![0u8; capacity + margin].into_boxed_slice()),
            capacity,
            margin,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            lock: Mutex::new(()),
            ready: Condvar::new(),
            get_timeout: Duration::from_millis(100),
            overflow_total: AtomicU64::new(0),
            overflow_log: Mutex::new(OverflowLog { count: 0, bytes: 0, last_report: None }),
        }
    }

    pub fn set_get_timeout(&mut self, timeout: Duration) {
        self.get_timeout = timeout;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        (self.head.load(Ordering::Acquire) - self.tail.load(Ordering::Acquire)) as usize
    }

    pub fn free(&self) -> usize {
        self.capacity - self.available()
    }

    /// Accepts as many bytes as fit and returns that count. Never blocks.
    pub fn put(&self, data: &[u8]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let free = self.capacity - (head - tail) as usize;
        let n = data.len().min(free);
        if n > 0 {
            let idx = (head as usize) % self.capacity;
            let first = n.min(self.capacity - idx);
            unsafe {
                let storage = &mut *self.storage.get();
                storage[idx..idx + first].copy_from_slice(&data[..first]);
                if n > first {
                    storage[..n - first].copy_from_slice(&data[first..n]);
                }
            }
            self.head.store(head + n as u64, Ordering::Release);
            let _guard = self.lock.lock().unwrap();
            self.ready.notify_one();
        }
        n
    }

    /// A contiguous readable region, or `None` after the poll timeout.
    /// At least `min(available, margin)` contiguous bytes are returned.
    pub fn get(&self) -> Option<&[u8]> {
        let deadline = Instant::now() + self.get_timeout;
        let mut avail = self.available();
        if avail == 0 {
            let mut guard = self.lock.lock().unwrap();
            loop {
                avail = self.available();
                if avail > 0 {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                let (g, _) = self.ready.wait_timeout(guard, deadline - now).unwrap();
                guard = g;
            }
        }

        let idx = (self.tail.load(Ordering::Relaxed) as usize) % self.capacity;
        let mut contiguous = avail.min(self.capacity - idx);
        if contiguous < avail && contiguous < self.margin {
            // mirror wrapped bytes into the slack region past `capacity`
            // (those positions are between tail and head, so the producer
            // is not writing them)
            let extra = (avail - contiguous).min(self.margin - contiguous);
            unsafe {
                let storage = &mut *self.storage.get();
                let (front, slack) = storage.split_at_mut(self.capacity);
                slack[..extra].copy_from_slice(&front[..extra]);
            }
            contiguous += extra;
        }
        unsafe {
            let storage = &*self.storage.get();
            Some(std::slice::from_raw_parts(storage.as_ptr().add(idx), contiguous))
        }
    }

    /// Releases `n` bytes from the head of the readable region.
    pub fn del(&self, n: usize) {
        let tail = self.tail.load(Ordering::Relaxed);
        debug_assert!(n as u64 <= self.head.load(Ordering::Acquire) - tail);
        self.tail.store(tail + n as u64, Ordering::Release);
    }

    /// Records `missed` dropped bytes; logs at most every five seconds.
    pub fn report_overflow(&self, missed: usize) {
        self.overflow_total.fetch_add(missed as u64, Ordering::Relaxed);
        let mut log = self.overflow_log.lock().unwrap();
        log.count += 1;
        log.bytes += missed as u64;
        let due = match log.last_report {
            None => true,
            Some(t) => t.elapsed() >= OVERFLOW_REPORT_DELTA,
        };
        if due {
            warn!("{} ring buffer overflows ({} bytes dropped)", log.count, log.bytes);
            log.count = 0;
            log.bytes = 0;
            log.last_report = Some(Instant::now());
        }
    }

    /// Total bytes ever dropped because the buffer was full.
    pub fn overflow_bytes(&self) -> u64 {
        self.overflow_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order_with_wraparound() {
        let ring = RingBuffer::with_margin(16, 4);
        assert_eq!(ring.put(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]), 12);
        assert_eq!(ring.get().unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        ring.del(10);
        // wraps: 4 bytes at the end, 4 at the front
        assert_eq!(ring.put(&[13, 14, 15, 16, 17, 18, 19, 20]), 8);
        let r = ring.get().unwrap();
        assert_eq!(&r[..2], &[11, 12]);
        ring.del(r.len());
        let mut collected: Vec<u8> = r[2..].to_vec();
        while collected.len() < 8 {
            let r = ring.get().unwrap();
            collected.extend_from_slice(r);
            ring.del(r.len());
        }
        assert_eq!(collected, &[13, 14, 15, 16, 17, 18, 19, 20]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn put_accepts_only_free_space() {
        let ring = RingBuffer::with_margin(10, 2);
        assert_eq!(ring.put(&[0; 15]), 10);
        assert_eq!(ring.put(&[0; 5]), 0);
        assert_eq!(ring.free(), 0);
        ring.del(4);
        assert_eq!(ring.put(&[0; 5]), 4);
    }

    #[test]
    fn overflow_accounting_is_exact() {
        let ring = RingBuffer::with_margin(1000, 8);
        let data = vec![0xABu8; 1500];
        let accepted = ring.put(&data);
        assert_eq!(accepted, 1000);
        ring.report_overflow(data.len() - accepted);
        assert_eq!(ring.overflow_bytes(), 500);
        ring.report_overflow(7);
        assert_eq!(ring.overflow_bytes(), 507);
    }

    #[test]
    fn margin_keeps_reads_contiguous() {
        let ring = RingBuffer::with_margin(10, 6);
        assert_eq!(ring.put(&[1, 2, 3, 4, 5, 6, 7, 8]), 8);
        let r = ring.get().unwrap();
        ring.del(6); // tail now at index 6
        assert_eq!(r.len(), 8);
        assert_eq!(ring.put(&[9, 10, 11, 12, 13, 14]), 6); // wraps at 10
        // tail run is 4 bytes (indices 6..10) but margin is 6: the get
        // must mirror wrapped bytes to stay contiguous
        let r = ring.get().unwrap();
        assert_eq!(&r[..6], &[7, 8, 9, 10, 11, 12]);
        ring.del(r.len());
        let mut rest: Vec<u8> = Vec::new();
        while ring.available() > 0 {
            let r = ring.get().unwrap();
            rest.extend_from_slice(r);
            ring.del(r.len());
        }
        assert_eq!(rest, &[13, 14]);
    }

    #[test]
    fn get_times_out_on_empty() {
        let mut ring = RingBuffer::new(1024);
        ring.set_get_timeout(Duration::from_millis(50));
        let start = Instant::now();
        assert!(ring.get().is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn producer_consumer_threads() {
        const CHUNKS: u64 = 532;
        const TOTAL: u64 = CHUNKS * 188;
        let ring = Arc::new(RingBuffer::with_margin(4096, 376));
        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut counter = 0u8;
                for _ in 0..CHUNKS {
                    let chunk: Vec<u8> = (0..188)
                        .map(|_| {
                            counter = counter.wrapping_add(1);
                            counter
                        })
                        .collect();
                    let mut off = 0;
                    while off < chunk.len() {
                        let n = ring.put(&chunk[off..]);
                        off += n;
                        if n == 0 {
                            std::thread::yield_now();
                        }
                    }
                }
            })
        };
        let mut received = 0u64;
        let mut expected = 0u8;
        while received < TOTAL {
            if let Some(r) = ring.get() {
                for &b in r {
                    expected = expected.wrapping_add(1);
                    assert_eq!(b, expected);
                }
                let n = r.len();
                ring.del(n);
                received += n as u64;
            }
        }
        producer.join().unwrap();
        assert_eq!(received, TOTAL);
    }
}
