//! Per-channel health monitor: FIPS continuous tests plus the 8- and
//! 16-bit ENT suites, combined under one hysteretic verdict.

use std::sync::{Arc, Mutex};

use crate::registry::{self, Monitor};
use crate::stats::ent::Ent;
use crate::stats::fips::{Fips, FIPS_BLOCK_BYTES, TEST_NAMES};

/// Sources slower than this get `assume_ent8_ok = true` so their first
/// blocks are not held hostage to the 500 000-sample Ent8 convergence.
pub const SLOW_SOURCE_BPS: u64 = 5_000_000;

struct MonitorInner {
    fips: Fips,
    ent8: Ent<8>,
    ent16: Ent<16>,
    fips_ok: bool,
    ent8_ok: bool,
    ent16_ok: bool,
    bytes_analysed: u64,
    bytes_passed: u64,
    /// Rolling remainder that has not yet filled a FIPS block.
    partial: Vec<u8>,
    last_verdict: Option<bool>,
}

/// A named health monitor. Registers itself in the process-wide registry
/// on construction and deregisters on drop.
pub struct HealthMonitor {
    id: String,
    inner: Mutex<MonitorInner>,
}

impl HealthMonitor {
    /// `assume_ent8_ok` picks the initial Ent8 verdict (use
    /// `bitrate < SLOW_SOURCE_BPS` for hardware sources). Ent16 starts ok;
    /// FIPS always starts not-ok.
    pub fn new(id: impl Into<String>, assume_ent8_ok: bool) -> Arc<Self> {
        let monitor = Arc::new(Self {
            id: id.into(),
            inner: Mutex::new(MonitorInner {
                fips: Fips::new(),
                ent8: Ent::<8>::new(assume_ent8_ok),
                ent16: Ent::<16>::new(true),
                fips_ok: false,
                ent8_ok: assume_ent8_ok,
                ent16_ok: true,
                bytes_analysed: 0,
                bytes_passed: 0,
                partial: Vec::with_capacity(FIPS_BLOCK_BYTES),
                last_verdict: None,
            }),
        });
        registry::register(&monitor.id, Monitor::Health(Arc::downgrade(&monitor)));
        monitor
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Feed one chunk through all three analysers and report whether the
    /// channel is currently trusted.
    pub fn check(&self, buf: &[u8]) -> bool {
        let mut g = self.inner.lock().unwrap();

        g.ent8.feed(buf);
        g.ent16.feed(buf);

        g.partial.extend_from_slice(buf);
        let mut offset = 0;
        while g.partial.len() - offset >= FIPS_BLOCK_BYTES {
            let mut block = [0u8; FIPS_BLOCK_BYTES];
            block.copy_from_slice(&g.partial[offset..offset + FIPS_BLOCK_BYTES]);
            g.fips.check_block(&block);
            offset += FIPS_BLOCK_BYTES;
        }
        if offset > 0 {
            g.partial.drain(..offset);
        }

        g.fips_ok = g.fips.is_ok();
        g.ent8_ok = g.ent8.is_ok();
        g.ent16_ok = g.ent16.is_ok();
        let ok = g.fips_ok && g.ent8_ok && g.ent16_ok;

        g.bytes_analysed += buf.len() as u64;
        if ok {
            g.bytes_passed += buf.len() as u64;
        }

        if g.last_verdict != Some(ok) {
            if ok {
                log::info!(
                    target: "entropyd::health",
                    "{}: channel good (fips {} ent8 {} ent16 {})",
                    self.id, g.fips_ok, g.ent8_ok, g.ent16_ok,
                );
            } else {
                log::warn!(
                    target: "entropyd::health",
                    "{}: channel suppressed (fips {} ent8 {} ent16 {})",
                    self.id, g.fips_ok, g.ent8_ok, g.ent16_ok,
                );
            }
            g.last_verdict = Some(ok);
        }
        ok
    }

    /// Current verdict without feeding data.
    pub fn is_ok(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.fips_ok && g.ent8_ok && g.ent16_ok
    }

    pub fn bytes_analysed(&self) -> u64 {
        self.inner.lock().unwrap().bytes_analysed
    }

    pub fn bytes_passed(&self) -> u64 {
        self.inner.lock().unwrap().bytes_passed
    }

    /// Statistics summary for the control protocol's `ReportStats`.
    pub fn stats(&self) -> serde_json::Value {
        let g = self.inner.lock().unwrap();

        let mut fips = serde_json::Map::new();
        fips.insert("Ok".into(), g.fips_ok.into());
        fips.insert("Blocks".into(), g.fips.blocks().into());
        for (name, stat) in TEST_NAMES.iter().zip(g.fips.stats().iter()) {
            fips.insert(
                (*name).into(),
                serde_json::to_value(stat).unwrap_or_default(),
            );
        }

        serde_json::json!({
            "QA": {
                "BytesAnalysed": g.bytes_analysed,
                "BytesPassed": g.bytes_passed,
                "Ok": g.fips_ok && g.ent8_ok && g.ent16_ok,
            },
            "FIPS": fips,
            "Ent8": {
                "Ok": g.ent8_ok,
                "Current": g.ent8.current(),
                "Min": g.ent8.min(),
                "Max": g.ent8.max(),
                "Failed": g.ent8.failed(),
            },
            "Ent16": {
                "Ok": g.ent16_ok,
                "Current": g.ent16.current(),
                "Min": g.ent16.min(),
                "Max": g.ent16.max(),
                "Failed": g.ent16.failed(),
            },
        })
    }

    /// Full accumulator state for the control protocol's `GetRawData`.
    pub fn raw_data(&self) -> serde_json::Value {
        let g = self.inner.lock().unwrap();
        serde_json::json!({
            "Ent8": &g.ent8,
            "Ent16": &g.ent16,
        })
    }

    /// One-line summary for shutdown logging.
    pub fn summary(&self) -> String {
        let g = self.inner.lock().unwrap();
        format!(
            "{}: analysed {} passed {} fips-blocks {} verdict {}",
            self.id,
            g.bytes_analysed,
            g.bytes_passed,
            g.fips.blocks(),
            if g.fips_ok && g.ent8_ok && g.ent16_ok {
                "good"
            } else {
                "suppressed"
            },
        )
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        registry::deregister(&self.id);
    }
}
