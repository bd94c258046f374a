//! Abstract hardware byte source and per-source configuration.
//!
//! The USB transport lives outside this crate; the pipeline only needs a
//! handle that produces chunks of raw octets and can be claimed, released
//! and soft-reset.

use crate::error::{DeviceError, Error, Result};

/// Smallest chunk we ask a device for (the USB max packet size).
pub const MIN_CHUNK: usize = 512;
/// Largest chunk we ask a device for.
pub const MAX_CHUNK: usize = 65_536;

/// Trait every hardware RNG transport must implement.
///
/// `read` fills the whole buffer or fails; partial reads are the
/// transport's problem to retry internally.
pub trait ByteSource: Send {
    /// Stable device identity; doubles as the monitor id.
    fn serial(&self) -> &str;

    /// Human-readable product name.
    fn product(&self) -> &str {
        "hwrng"
    }

    /// Configured bitrate in bits per second.
    fn bitrate(&self) -> u64;

    fn claim(&mut self) -> std::result::Result<(), DeviceError>;
    fn release(&mut self) -> std::result::Result<(), DeviceError>;
    fn reset(&mut self) -> std::result::Result<(), DeviceError>;
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<(), DeviceError>;
}

/// Largest power-of-two chunk in `[MIN_CHUNK, MAX_CHUNK]` whose transfer
/// takes at most 250 ms at the given bitrate.
pub fn chunk_size(bitrate: u64) -> usize {
    let cap = bitrate / 32; // bytes per 250 ms
    let mut chunk = MIN_CHUNK;
    while chunk * 2 <= MAX_CHUNK && (chunk as u64) * 2 <= cap {
        chunk *= 2;
    }
    chunk
}

/// Per-source pipeline configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Group this source votes into; 0 is the pass-through group.
    pub group_id: u32,
    /// Bytes committed to the pool per group vote; power of two.
    pub group_buffer_size: usize,
    /// XOR-fold passes applied to each raw buffer.
    pub fold_bits: u32,
    /// First backoff when the pool is full, in milliseconds.
    pub idle_sleep_init_ms: u64,
    /// Backoff ceiling; 0 means sleep on the condition variable instead of
    /// a timed wait.
    pub idle_sleep_max_ms: u64,
    /// Release the USB claim before sleeps longer than this; 0 disables
    /// suspension.
    pub suspend_after_ms: u64,
    /// Bypass the health monitor (test rigs and trusted downstream mixers).
    pub skip_qa: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            group_id: 0,
            group_buffer_size: 65_536,
            fold_bits: 1,
            idle_sleep_init_ms: 100,
            idle_sleep_max_ms: 60_000,
            suspend_after_ms: 10_000,
            skip_qa: false,
        }
    }
}

impl SourceConfig {
    /// Raw buffer size needed so one fold pass sequence yields exactly one
    /// group vote.
    pub fn buffer_size(&self) -> usize {
        self.group_buffer_size << self.fold_bits
    }

    pub fn validate(&self, chunk: usize) -> Result<()> {
        if !self.group_buffer_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "group buffer size {} is not a power of two",
                self.group_buffer_size
            )));
        }
        if self.fold_bits > 8 {
            return Err(Error::Config(format!(
                "fold count {} is unreasonable",
                self.fold_bits
            )));
        }
        if self.buffer_size() < chunk {
            return Err(Error::Config(format!(
                "source buffer of {} bytes is smaller than the {}-byte device chunk",
                self.buffer_size(),
                chunk
            )));
        }
        Ok(())
    }
}
