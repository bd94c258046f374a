//! Bounded entropy pool shared between source workers and consumers.
//!
//! The pool is a fixed buffer with two phases: while there is room,
//! deposits are copied in and `fill` grows; once full, further deposits are
//! XOR-mixed at a moving cursor so late entropy still perturbs the pool
//! without displacing what readers have not yet consumed. Readers take
//! bytes from the top of the filled region and block until enough have
//! accumulated.
//!
//! One mutex guards the buffer; two condition variables carry the
//! backpressure: `sink_cv` wakes readers when bytes arrive, `source_cv`
//! wakes throttled source workers when a reader makes room.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

struct PoolInner {
    buffer: Vec<u8>,
    fill: usize,
    next: usize,
}

pub struct Pool {
    size: usize,
    inner: Mutex<PoolInner>,
    source_cv: Condvar,
    sink_cv: Condvar,
    shutdown: AtomicBool,
}

impl Pool {
    pub fn new(size: usize) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(Error::Config("pool size must be non-zero".into()));
        }
        Ok(Arc::new(Self {
            size,
            inner: Mutex::new(PoolInner {
                buffer: vec![0; size],
                fill: 0,
                next: 0,
            }),
            source_cv: Condvar::new(),
            sink_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes currently available to readers.
    pub fn fill(&self) -> usize {
        self.inner.lock().unwrap().fill
    }

    pub fn is_full(&self) -> bool {
        self.fill() >= self.size
    }

    /// Deposit entropy: copy while there is room, then XOR-mix the
    /// remainder at the roving cursor. Never blocks.
    pub fn add_entropy(&self, buf: &[u8]) {
        let mut g = self.inner.lock().unwrap();
        let direct = (self.size - g.fill).min(buf.len());
        if direct > 0 {
            let fill = g.fill;
            g.buffer[fill..fill + direct].copy_from_slice(&buf[..direct]);
            g.fill += direct;
            self.sink_cv.notify_all();
        }
        for &b in &buf[direct..] {
            let next = g.next;
            g.buffer[next] ^= b;
            g.next = (next + 1) % self.size;
        }
    }

    /// Blocking read: waits until `min(out.len(), pool size)` bytes are
    /// available, then drains up to `out.len()` bytes from the top of the
    /// filled region. Returns 0 only after [`Pool::shutdown`].
    pub fn read(&self, out: &mut [u8]) -> usize {
        let want = out.len();
        if want == 0 {
            return 0;
        }
        let target = want.min(self.size);
        let mut g = self.inner.lock().unwrap();
        while g.fill < target && !self.shutdown.load(Ordering::Acquire) {
            g = self.sink_cv.wait(g).unwrap();
        }
        if g.fill < target {
            return 0;
        }
        let got = g.fill.min(want);
        out[..got].copy_from_slice(&g.buffer[g.fill - got..g.fill]);
        g.fill -= got;
        self.source_cv.notify_all();
        got
    }

    /// Source-side backpressure: wait until the pool has room again, the
    /// timeout lapses, or the pool shuts down. Returns true when there is
    /// room.
    pub fn wait_not_full(&self, timeout: Option<Duration>) -> bool {
        let mut g = self.inner.lock().unwrap();
        match timeout {
            None => {
                while g.fill >= self.size && !self.shutdown.load(Ordering::Acquire) {
                    g = self.source_cv.wait(g).unwrap();
                }
            }
            Some(t) => {
                let deadline = Instant::now() + t;
                while g.fill >= self.size && !self.shutdown.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self.source_cv.wait_timeout(g, deadline - now).unwrap();
                    g = guard;
                }
            }
        }
        g.fill < self.size
    }

    /// Wake every waiter and make subsequent reads return 0. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _g = self.inner.lock().unwrap();
        self.sink_cv.notify_all();
        self.source_cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
