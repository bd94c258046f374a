//! OS kernel entropy interface.
//!
//! The pipeline only needs two operations from the host: hand over a
//! buffer with an entropy credit, and block until the kernel pool wants
//! more. On Linux that is the `RNDADDENTROPY` ioctl on `/dev/random` plus
//! a level-triggered `POLLOUT` poll (writable means the pool is below its
//! watermark).

use std::time::Duration;

use crate::error::Result;

/// Collaborator trait for the host entropy facility.
pub trait KernelEntropy: Send {
    /// Hand `buf` to the OS pool, crediting `bits` bits of entropy.
    fn add_entropy(&mut self, buf: &[u8], bits: u32) -> Result<()>;

    /// Block until the OS wants more entropy or `timeout` lapses.
    fn wait_ready(&mut self, timeout: Duration) -> Result<()>;
}

#[cfg(target_os = "linux")]
pub use linux::DevRandom;

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    use super::KernelEntropy;
    use crate::error::{Error, Result};

    /// ioctl number for RNDADDENTROPY: _IOW('R', 0x03, int[2])
    const RNDADDENTROPY: libc::c_ulong = 0x4008_5203;

    /// `/dev/random` writer. Requires root.
    pub struct DevRandom {
        file: File,
    }

    impl DevRandom {
        pub fn open() -> Result<Self> {
            let file = OpenOptions::new()
                .write(true)
                .open("/dev/random")
                .map_err(|e| {
                    Error::Config(format!(
                        "cannot open /dev/random for writing: {e} (are you root?)"
                    ))
                })?;
            Ok(Self { file })
        }
    }

    impl KernelEntropy for DevRandom {
        fn add_entropy(&mut self, buf: &[u8], bits: u32) -> Result<()> {
            // struct rand_pool_info {
            //     int entropy_count;
            //     int buf_size;
            //     __u32 buf[];   // must be u32-aligned
            // };
            let padded = (buf.len() + 3) & !3;
            let mut raw = vec![0u8; 8 + padded];
            raw[0..4].copy_from_slice(&(bits as i32).to_ne_bytes());
            raw[4..8].copy_from_slice(&(buf.len() as i32).to_ne_bytes());
            raw[8..8 + buf.len()].copy_from_slice(buf);

            let ret = unsafe {
                libc::ioctl(self.file.as_raw_fd(), RNDADDENTROPY, raw.as_ptr())
            };
            if ret < 0 {
                return Err(Error::System(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
            let mut fds = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLOUT,
                revents: 0,
            };
            let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
            let ret = unsafe { libc::poll(&mut fds, 1, ms) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return Ok(());
                }
                return Err(Error::System(err));
            }
            Ok(())
        }
    }
}
