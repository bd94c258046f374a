//! File-backed byte source for character-device HWRNG nodes.
//!
//! The real USB transport lives outside the daemon; for `/dev/hwrng`-style
//! nodes (and test fixtures) a plain file read is all the transport there
//! is. Claim opens the node, release closes it, reset reopens it.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use entropyd_core::error::{DeviceError, DeviceErrorKind, Error, Result};
use entropyd_core::ByteSource;

#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    serial: String,
    bitrate: u64,
    file: Option<File>,
}

impl FileSource {
    /// Open the node once up front so misconfiguration fails at startup,
    /// not in the worker thread.
    pub fn open(path: &Path, bitrate: u64) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            serial: path.display().to_string(),
            bitrate,
            file: Some(file),
        })
    }
}

fn classify(e: &std::io::Error) -> DeviceErrorKind {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => DeviceErrorKind::Timeout,
        std::io::ErrorKind::BrokenPipe => DeviceErrorKind::Pipe,
        std::io::ErrorKind::Interrupted => DeviceErrorKind::Other,
        _ => DeviceErrorKind::Fatal,
    }
}

impl ByteSource for FileSource {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn product(&self) -> &str {
        "file"
    }

    fn bitrate(&self) -> u64 {
        self.bitrate
    }

    fn claim(&mut self) -> std::result::Result<(), DeviceError> {
        if self.file.is_none() {
            let file = File::open(&self.path).map_err(|e| {
                DeviceError::new(DeviceErrorKind::Fatal, format!("reopen failed: {e}"))
            })?;
            self.file = Some(file);
        }
        Ok(())
    }

    fn release(&mut self) -> std::result::Result<(), DeviceError> {
        self.file = None;
        Ok(())
    }

    fn reset(&mut self) -> std::result::Result<(), DeviceError> {
        self.release()?;
        self.claim()
    }

    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<(), DeviceError> {
        let Some(file) = self.file.as_mut() else {
            return Err(DeviceError::new(DeviceErrorKind::Fatal, "device not claimed"));
        };
        file.read_exact(buf).map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DeviceErrorKind::Fatal
            } else {
                classify(&e)
            };
            DeviceError::new(kind, e.to_string())
        })
    }
}
