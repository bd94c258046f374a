//! The daemon object: owns the pool, the groups and every worker thread.
//!
//! Workers are plain OS threads that block on the pool's condition
//! variables, device reads or OS readiness waits. Shutdown signals the
//! pool (which wakes every condvar waiter), then joins each worker with a
//! bounded timed join; a thread stuck in a device read past the timeout is
//! deliberately leaked rather than deadlocking shutdown.

use std::collections::HashMap;
use std::io::Write;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::feeder;
use crate::group::Group;
use crate::kernel::KernelEntropy;
use crate::pool::Pool;
use crate::source::{ByteSource, SourceConfig, chunk_size};
use crate::worker::{self, SourceWorker};

/// How long shutdown waits for each worker before leaking it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Read granularity of FD writers.
const WRITER_CHUNK: usize = 4096;

struct Worker {
    name: String,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

pub struct Daemon {
    pool: Arc<Pool>,
    groups: HashMap<u32, Arc<Group>>,
    workers: Vec<Worker>,
}

impl Daemon {
    pub fn new(pool_size: usize) -> Result<Self> {
        Ok(Self {
            pool: Pool::new(pool_size)?,
            groups: HashMap::new(),
            workers: Vec::new(),
        })
    }

    pub fn pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool)
    }

    fn group(&mut self, id: u32, size: usize) -> Result<Arc<Group>> {
        if let Some(group) = self.groups.get(&id) {
            if group.size() != size {
                return Err(Error::Config(format!(
                    "group {id} already exists with buffer size {}, not {size}",
                    group.size()
                )));
            }
            return Ok(Arc::clone(group));
        }
        let group = Group::new(id, size)?;
        self.groups.insert(id, Arc::clone(&group));
        Ok(group)
    }

    /// Attach a hardware source and start its worker thread.
    pub fn add_source(&mut self, dev: Box<dyn ByteSource>, cfg: SourceConfig) -> Result<()> {
        let chunk = chunk_size(dev.bitrate()).min(cfg.buffer_size());
        cfg.validate(chunk)?;
        let group = self.group(cfg.group_id, cfg.group_buffer_size)?;
        let mask = group.take_mask()?;
        let name = format!("src-{}", dev.serial());
        let ctx = SourceWorker {
            pool: self.pool(),
            group,
            mask,
            dev,
            cfg,
        };
        self.spawn(name, move || worker::run(ctx))
    }

    /// Start the kernel feeder.
    pub fn add_kernel_feeder(
        &mut self,
        sink: Box<dyn KernelEntropy>,
        refill: Duration,
    ) -> Result<()> {
        let pool = self.pool();
        self.spawn("kernel-feeder".into(), move || {
            feeder::run_kernel_feeder(pool, sink, refill)
        })
    }

    /// Start an FD writer streaming pool bytes into `out`.
    pub fn add_fd_writer(
        &mut self,
        id: impl Into<String>,
        out: Box<dyn Write + Send>,
        limit: Option<u64>,
        qa: bool,
    ) -> Result<()> {
        let id = id.into();
        let pool = self.pool();
        let name = format!("writer-{id}");
        self.spawn(name, move || {
            feeder::run_fd_writer(pool, id, out, limit, qa, WRITER_CHUNK)
        })
    }

    /// Start a QA sink: monitor an external source without feeding the
    /// pool.
    pub fn add_qa_sink(&mut self, dev: Box<dyn ByteSource>, read_size: usize) -> Result<()> {
        if read_size == 0 {
            return Err(Error::Config("qa sink read size must be non-zero".into()));
        }
        let pool = self.pool();
        let name = format!("qa-{}", dev.serial());
        self.spawn(name, move || feeder::run_qa_sink(pool, dev, read_size))
    }

    fn spawn(&mut self, name: String, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // Translate panics at the thread boundary into a log line
                // and an orderly exit.
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
                    log::error!(
                        target: "entropyd::daemon",
                        "worker {thread_name} panicked"
                    );
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| Error::Resource(format!("cannot spawn {name}: {e}")))?;
        self.workers.push(Worker {
            name,
            handle,
            done: done_rx,
        });
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal shutdown and join every worker, leaking any that exceed the
    /// join timeout.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
        for worker in self.workers.drain(..) {
            match worker.done.recv_timeout(JOIN_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        target: "entropyd::daemon",
                        "worker {} did not stop within {JOIN_TIMEOUT:?}; leaking it",
                        worker.name
                    );
                    drop(worker.handle);
                }
            }
        }
        for (id, monitor) in crate::registry::all() {
            log::info!(target: "entropyd::daemon", "final stats [{id}] {}", monitor.summary());
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, DeviceErrorKind};

    struct CountingSource {
        serial: String,
        reads_left: usize,
    }

    impl ByteSource for CountingSource {
        fn serial(&self) -> &str {
            &self.serial
        }
        fn bitrate(&self) -> u64 {
            1_000_000
        }
        fn claim(&mut self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
        fn release(&mut self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
        fn reset(&mut self) -> std::result::Result<(), DeviceError> {
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> std::result::Result<(), DeviceError> {
            if self.reads_left == 0 {
                return Err(DeviceError::new(DeviceErrorKind::Fatal, "exhausted"));
            }
            self.reads_left -= 1;
            for (i, b) in buf.iter_mut().enumerate() {
                *b = i as u8;
            }
            Ok(())
        }
    }

    #[test]
    fn group_size_conflict_is_rejected() {
        let mut d = Daemon::new(1 << 16).unwrap();
        let a = CountingSource {
            serial: "daemon-a".into(),
            reads_left: 0,
        };
        let b = CountingSource {
            serial: "daemon-b".into(),
            reads_left: 0,
        };
        let cfg_a = SourceConfig {
            group_id: 3,
            group_buffer_size: 4096,
            fold_bits: 0,
            skip_qa: true,
            ..SourceConfig::default()
        };
        let cfg_b = SourceConfig {
            group_buffer_size: 8192,
            ..cfg_a.clone()
        };
        d.add_source(Box::new(a), cfg_a).unwrap();
        let err = d.add_source(Box::new(b), cfg_b).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn invalid_source_config_is_rejected() {
        let mut d = Daemon::new(1 << 16).unwrap();
        let cfg = SourceConfig {
            group_buffer_size: 3000,
            ..SourceConfig::default()
        };
        let dev = CountingSource {
            serial: "daemon-c".into(),
            reads_left: 0,
        };
        assert!(d.add_source(Box::new(dev), cfg).is_err());
    }

    #[test]
    fn shutdown_joins_finished_workers() {
        let mut d = Daemon::new(1 << 16).unwrap();
        let dev = CountingSource {
            serial: "daemon-d".into(),
            reads_left: 2,
        };
        let cfg = SourceConfig {
            group_buffer_size: 8192,
            fold_bits: 0,
            skip_qa: true,
            ..SourceConfig::default()
        };
        d.add_source(Box::new(dev), cfg).unwrap();
        assert_eq!(d.worker_count(), 1);

        // The worker exhausts its device and exits on its own; shutdown
        // must still join it cleanly.
        std::thread::sleep(Duration::from_millis(100));
        d.shutdown();
        assert_eq!(d.worker_count(), 0);
    }
}
