//! Per-source worker loop: read, fold, health-check, commit, throttle.

use std::sync::Arc;
use std::time::Duration;

use crate::fold::fold_in_place;
use crate::group::Group;
use crate::health::{HealthMonitor, SLOW_SOURCE_BPS};
use crate::pool::Pool;
use crate::source::{ByteSource, SourceConfig, chunk_size};

/// Sleeps shorter than this are skipped; the device read itself paces the
/// loop at that point.
pub const MIN_SLEEP_MS: u64 = 512;

pub(crate) struct SourceWorker {
    pub pool: Arc<Pool>,
    pub group: Arc<Group>,
    pub mask: u32,
    pub dev: Box<dyn ByteSource>,
    pub cfg: SourceConfig,
}

/// Idle throttle state: no backoff, a timed backoff, or parked on the
/// pool's source condition variable until a reader makes room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Idle {
    None,
    Timed(u64),
    Forever,
}

pub(crate) fn run(mut w: SourceWorker) {
    let serial = w.dev.serial().to_string();
    let bitrate = w.dev.bitrate();
    let buffer_size = w.cfg.buffer_size();
    let chunk = chunk_size(bitrate).min(buffer_size);
    let monitor = HealthMonitor::new(serial.clone(), bitrate < SLOW_SOURCE_BPS);
    let mut buffer = vec![0u8; buffer_size];
    let mut idle = Idle::None;

    log::info!(
        target: "entropyd::source",
        "{serial}: worker up ({} @ {bitrate} bps, chunk {chunk}, buffer {buffer_size}, \
         group {} fold {}{})",
        w.dev.product(),
        w.cfg.group_id,
        w.cfg.fold_bits,
        if w.cfg.skip_qa { ", qa skipped" } else { "" },
    );

    if let Err(e) = w.dev.claim() {
        log::error!(target: "entropyd::source", "{serial}: cannot claim device: {e}");
        w.group.release_mask(w.mask);
        return;
    }
    let mut claimed = true;

    let mut reset_spent = false;
    'main: while !w.pool.is_shutdown() {
        // Throttle while the pool is full. Long sleeps release the USB
        // claim so an idle device does not hold the bus.
        match idle {
            Idle::Forever => {
                if claimed && w.cfg.suspend_after_ms > 0 {
                    let _ = w.dev.release();
                    claimed = false;
                }
                w.pool.wait_not_full(None);
            }
            Idle::Timed(ms) if ms >= MIN_SLEEP_MS => {
                if claimed && w.cfg.suspend_after_ms > 0 && ms > w.cfg.suspend_after_ms {
                    let _ = w.dev.release();
                    claimed = false;
                }
                w.pool.wait_not_full(Some(Duration::from_millis(ms)));
            }
            _ => {}
        }
        if w.pool.is_shutdown() {
            break;
        }
        if !claimed {
            if let Err(e) = w.dev.claim() {
                log::error!(target: "entropyd::source", "{serial}: re-claim failed: {e}");
                break;
            }
            claimed = true;
        }

        // Fill the raw buffer one device chunk at a time.
        for off in (0..buffer_size).step_by(chunk) {
            if let Err(e) = w.dev.read(&mut buffer[off..off + chunk]) {
                if e.is_transient() && !reset_spent {
                    log::warn!(
                        target: "entropyd::source",
                        "{serial}: transient fault, soft reset: {e}"
                    );
                    reset_spent = true;
                    if let Err(e) = w.dev.reset() {
                        log::error!(target: "entropyd::source", "{serial}: reset failed: {e}");
                        break 'main;
                    }
                    continue 'main;
                }
                log::error!(target: "entropyd::source", "{serial}: device failed: {e}");
                break 'main;
            }
        }
        reset_spent = false;

        let n = match fold_in_place(&mut buffer, buffer_size, w.cfg.fold_bits) {
            Ok(n) => n,
            Err(e) => {
                log::error!(target: "entropyd::source", "{serial}: {e}");
                break;
            }
        };

        let good = monitor.check(&buffer[..n]);
        if good || w.cfg.skip_qa {
            if let Err(e) = w.group.add_entropy(&w.pool, w.mask, &buffer[..n]) {
                log::error!(target: "entropyd::source", "{serial}: {e}");
                break;
            }
        }

        // Idle policy: a failed check forces an immediate retry so the
        // monitor can re-evaluate; otherwise back off while the pool is
        // full, doubling up to the ceiling.
        idle = if !good && !w.cfg.skip_qa {
            Idle::None
        } else if w.pool.is_full() {
            match idle {
                _ if w.cfg.idle_sleep_max_ms == 0 => Idle::Forever,
                Idle::None => Idle::Timed(w.cfg.idle_sleep_init_ms),
                Idle::Timed(ms) => Idle::Timed((ms * 2).min(w.cfg.idle_sleep_max_ms)),
                Idle::Forever => Idle::Forever,
            }
        } else {
            Idle::None
        };
    }

    if claimed {
        let _ = w.dev.release();
    }
    w.group.release_mask(w.mask);
    log::info!(target: "entropyd::source", "worker down; {}", monitor.summary());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, DeviceErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic device: replays a byte pattern, optionally failing
    /// after a number of reads.
    struct ScriptedSource {
        serial: String,
        bitrate: u64,
        counter: u8,
        reads_left: usize,
        fail_kind: DeviceErrorKind,
        claims: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(serial: &str, reads_left: usize, fail_kind: DeviceErrorKind) -> Self {
            Self {
                serial: serial.to_string(),
                bitrate: 1_000_000,
                counter: 0,
                reads_left,
                fail_kind,
                claims: Arc::new(AtomicUsize::new(0)),
                resets: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ByteSource for ScriptedSource {
        fn serial(&self) -> &str {
            &self.serial
        }
        fn bitrate(&self) -> u64 {
            self.bitrate
        }
        fn claim(&mut self) -> Result<(), DeviceError> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn release(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn reset(&mut self) -> Result<(), DeviceError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
            if self.reads_left == 0 {
                return Err(DeviceError::new(self.fail_kind, "scripted fault"));
            }
            self.reads_left -= 1;
            for b in buf.iter_mut() {
                *b = self.counter;
                self.counter = self.counter.wrapping_add(1);
            }
            Ok(())
        }
    }

    fn worker_for(dev: ScriptedSource, pool: &Arc<Pool>, cfg: SourceConfig) -> SourceWorker {
        let group = Group::new(cfg.group_id, cfg.group_buffer_size).unwrap();
        let mask = group.take_mask().unwrap();
        SourceWorker {
            pool: Arc::clone(pool),
            group,
            mask,
            dev: Box::new(dev),
            cfg,
        }
    }

    #[test]
    fn worker_folds_and_commits_until_device_dies() {
        let pool = Pool::new(1 << 16).unwrap();
        let cfg = SourceConfig {
            group_buffer_size: 16_384,
            fold_bits: 1,
            skip_qa: true,
            ..SourceConfig::default()
        };
        // buffer = 32 KiB = 2 chunks of 16 KiB at 1 Mbps; allow exactly
        // two buffer fills, then fail fatally.
        let dev = ScriptedSource::new("worker-test-a", 4, DeviceErrorKind::Fatal);
        run(worker_for(dev, &pool, cfg));

        assert_eq!(pool.fill(), 2 * 16_384, "two folded buffers committed");

        // The committed bytes are the XOR-fold of the counter stream.
        let mut expected = vec![0u8; 32_768];
        let mut counter = 0u8;
        for b in expected.iter_mut() {
            *b = counter;
            counter = counter.wrapping_add(1);
        }
        let n = fold_in_place(&mut expected, 32_768, 1).unwrap();
        let mut out = vec![0u8; 16_384];
        assert_eq!(pool.read(&mut out), 16_384);
        // Top read returns the second commit; the counter stream repeats
        // every 256 bytes, so both commits carry the same folded pattern.
        assert_eq!(out, expected[..n]);
    }

    #[test]
    fn transient_fault_gets_one_reset() {
        let pool = Pool::new(1 << 16).unwrap();
        let cfg = SourceConfig {
            group_buffer_size: 8_192,
            fold_bits: 0,
            skip_qa: true,
            ..SourceConfig::default()
        };
        let dev = ScriptedSource::new("worker-test-b", 0, DeviceErrorKind::Timeout);
        let resets = Arc::clone(&dev.resets);
        run(worker_for(dev, &pool, cfg));
        // First read times out, the worker resets once, the retry times out
        // again and the worker gives up without a second reset.
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(pool.fill(), 0);
    }

    #[test]
    fn failed_qa_blocks_commits() {
        let pool = Pool::new(1 << 16).unwrap();
        let cfg = SourceConfig {
            group_buffer_size: 8_192,
            fold_bits: 0,
            skip_qa: false,
            ..SourceConfig::default()
        };
        // A constant stream can never pass FIPS, and the monitor starts
        // not-ok anyway; nothing may reach the pool.
        struct ZeroSource {
            reads_left: usize,
        }
        impl ByteSource for ZeroSource {
            fn serial(&self) -> &str {
                "worker-test-zeros"
            }
            fn bitrate(&self) -> u64 {
                1_000_000
            }
            fn claim(&mut self) -> Result<(), DeviceError> {
                Ok(())
            }
            fn release(&mut self) -> Result<(), DeviceError> {
                Ok(())
            }
            fn reset(&mut self) -> Result<(), DeviceError> {
                Ok(())
            }
            fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
                if self.reads_left == 0 {
                    return Err(DeviceError::new(DeviceErrorKind::Fatal, "done"));
                }
                self.reads_left -= 1;
                buf.fill(0);
                Ok(())
            }
        }
        let group = Group::new(0, 8_192).unwrap();
        let mask = group.take_mask().unwrap();
        run(SourceWorker {
            pool: Arc::clone(&pool),
            group,
            mask,
            dev: Box::new(ZeroSource { reads_left: 6 }),
            cfg,
        });
        assert_eq!(pool.fill(), 0, "suppressed bytes never reach the pool");
    }

    #[test]
    fn full_pool_parks_worker_until_a_reader_drains() {
        // Pool holds exactly one commit; with idle_sleep_max_ms == 0 the
        // worker parks on the source condvar after filling it.
        let pool = Pool::new(4096).unwrap();
        let cfg = SourceConfig {
            group_buffer_size: 4096,
            fold_bits: 0,
            skip_qa: true,
            idle_sleep_max_ms: 0,
            ..SourceConfig::default()
        };
        let dev = ScriptedSource::new("worker-test-park", 64, DeviceErrorKind::Fatal);
        let ctx = worker_for(dev, &pool, cfg);

        let p2 = Arc::clone(&pool);
        let worker = std::thread::spawn(move || run(ctx));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !p2.is_full() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(p2.is_full(), "first commit fills the pool");

        // Drain; the parked worker must wake and refill.
        let mut out = vec![0u8; 4096];
        assert_eq!(p2.read(&mut out), 4096);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !p2.is_full() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(p2.is_full(), "worker wakes from the condvar and refills");

        pool.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn released_mask_is_reusable_after_worker_exit() {
        let pool = Pool::new(4096).unwrap();
        let group = Group::new(7, 2048).unwrap();
        let mask = group.take_mask().unwrap();
        let cfg = SourceConfig {
            group_id: 7,
            group_buffer_size: 2048,
            fold_bits: 0,
            skip_qa: true,
            ..SourceConfig::default()
        };
        run(SourceWorker {
            pool: Arc::clone(&pool),
            group: Arc::clone(&group),
            mask,
            dev: Box::new(ScriptedSource::new("worker-test-c", 1, DeviceErrorKind::Fatal)),
            cfg,
        });
        assert_eq!(group.member_count(), 0);
        assert_eq!(group.take_mask().unwrap(), mask);
    }
}
