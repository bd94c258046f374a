//! Control socket server.
//!
//! Listens on a TCP endpoint (`tcp:host:port`) or an absolute UNIX socket
//! path, speaks the NUL-framed JSON protocol of [`proto`], and serves
//! monitor statistics from the process-wide registry. Connection threads
//! never touch pool data, so a stalled pipeline can still be diagnosed.
//!
//! UNIX sockets are created mode `0600` (`0660` for group access) inside a
//! parent directory forced to `0700`/`0770`, with an exclusively flocked
//! sibling `<path>.lock` file so a stale socket left by a dead daemon is
//! distinguishable from a live one.

pub mod proto;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use entropyd_core::error::{Error, Result};

/// Poll interval of the accept loops.
const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// Read timeout of connection threads; bounds shutdown latency.
const READ_POLL: Duration = Duration::from_millis(200);
/// A connection sending an unterminated message beyond this is dropped.
const MAX_MESSAGE: usize = 1 << 20;

/// Where the control server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddr {
    /// `tcp:host:port`
    Tcp(String),
    /// Absolute UNIX socket path.
    Unix(PathBuf),
}

impl ControlAddr {
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(hostport) = s.strip_prefix("tcp:") {
            if hostport.rsplit_once(':').is_none() {
                return Err(Error::Config(format!(
                    "control address {s:?} needs tcp:host:port"
                )));
            }
            return Ok(ControlAddr::Tcp(hostport.to_string()));
        }
        if s.starts_with('/') {
            return Ok(ControlAddr::Unix(PathBuf::from(s)));
        }
        Err(Error::Config(format!(
            "control address {s:?} is neither tcp:host:port nor an absolute path"
        )))
    }
}

/// Socket creation options.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Grant group access: socket mode 0660 in a 0770 directory instead of
    /// 0600/0700.
    pub shared_group: bool,
}

/// Running control server; dropping it stops the listener and joins every
/// connection thread.
#[derive(Debug)]
pub struct ControlServer {
    shutdown: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
    tcp_addr: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
    _lock: Option<std::fs::File>,
}

impl ControlServer {
    pub fn start(addr: &ControlAddr, opts: &SocketOptions) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let conns: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        match addr {
            ControlAddr::Tcp(hostport) => {
                let listener = TcpListener::bind(hostport.as_str())?;
                listener.set_nonblocking(true)?;
                let tcp_addr = listener.local_addr()?;
                log::info!(target: "entropyd::control", "control socket on tcp:{tcp_addr}");

                let flag = Arc::clone(&shutdown);
                let conn_list = Arc::clone(&conns);
                let accept = std::thread::Builder::new()
                    .name("ctrl-accept".into())
                    .spawn(move || accept_tcp(listener, flag, conn_list))
                    .map_err(|e| Error::Resource(format!("cannot spawn acceptor: {e}")))?;

                Ok(Self {
                    shutdown,
                    accept: Some(accept),
                    conns,
                    tcp_addr: Some(tcp_addr),
                    unix_path: None,
                    _lock: None,
                })
            }
            ControlAddr::Unix(path) => {
                let (listener, lock) = bind_unix(path, opts)?;
                listener.set_nonblocking(true)?;
                log::info!(
                    target: "entropyd::control",
                    "control socket on {}", path.display()
                );

                let flag = Arc::clone(&shutdown);
                let conn_list = Arc::clone(&conns);
                let accept = std::thread::Builder::new()
                    .name("ctrl-accept".into())
                    .spawn(move || accept_unix(listener, flag, conn_list))
                    .map_err(|e| Error::Resource(format!("cannot spawn acceptor: {e}")))?;

                Ok(Self {
                    shutdown,
                    accept: Some(accept),
                    conns,
                    tcp_addr: None,
                    unix_path: Some(path.clone()),
                    _lock: Some(lock),
                })
            }
        }
    }

    /// Bound TCP address (useful with `tcp:host:0`).
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        for conn in self.conns.lock().unwrap().drain(..) {
            let _ = conn.join();
        }
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(lock_path(path));
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// Create the UNIX listener: tighten the parent directory, take the
/// exclusive advisory lock, clear any stale socket, bind and chmod.
fn bind_unix(path: &Path, opts: &SocketOptions) -> Result<(UnixListener, std::fs::File)> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let dir_mode = if opts.shared_group { 0o770 } else { 0o700 };
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(dir_mode))?;

    let lock = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    let ret = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        return Err(Error::Resource(format!(
            "control socket {} is held by another process",
            path.display()
        )));
    }

    // With the lock held, any existing socket file is stale.
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    let mode = if opts.shared_group { 0o660 } else { 0o600 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok((listener, lock))
}

fn accept_tcp(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!(target: "entropyd::control", "connection from {peer}");
                spawn_conn(stream, &shutdown, &conns, |s| {
                    s.set_read_timeout(Some(READ_POLL)).map_err(Error::System)
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::error!(target: "entropyd::control", "accept failed: {e}");
                break;
            }
        }
    }
}

fn accept_unix(
    listener: UnixListener,
    shutdown: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                log::debug!(target: "entropyd::control", "local connection");
                spawn_conn(stream, &shutdown, &conns, |s| {
                    s.set_read_timeout(Some(READ_POLL)).map_err(Error::System)
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::error!(target: "entropyd::control", "accept failed: {e}");
                break;
            }
        }
    }
}

fn spawn_conn<S>(
    stream: S,
    shutdown: &Arc<AtomicBool>,
    conns: &Arc<Mutex<Vec<JoinHandle<()>>>>,
    configure: impl FnOnce(&S) -> Result<()>,
) where
    S: Read + Write + Send + 'static,
{
    if let Err(e) = configure(&stream) {
        log::warn!(target: "entropyd::control", "cannot configure connection: {e}");
        return;
    }
    let flag = Arc::clone(shutdown);
    match std::thread::Builder::new()
        .name("ctrl-conn".into())
        .spawn(move || serve_conn(stream, &flag))
    {
        Ok(handle) => conns.lock().unwrap().push(handle),
        Err(e) => log::error!(target: "entropyd::control", "cannot spawn connection: {e}"),
    }
}

/// One connection: accumulate bytes, answer each NUL-terminated request.
/// Protocol errors close only this connection.
fn serve_conn<S: Read + Write>(mut stream: S, shutdown: &AtomicBool) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];
    while !shutdown.load(Ordering::Acquire) {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == 0) {
                    let frame: Vec<u8> = pending.drain(..=pos).collect();
                    let reply = proto::handle_message(&frame[..frame.len() - 1]);
                    if stream.write_all(&proto::encode(&reply)).is_err() {
                        return;
                    }
                }
                if pending.len() > MAX_MESSAGE {
                    log::warn!(
                        target: "entropyd::control",
                        "dropping connection: unterminated {}-byte message",
                        pending.len()
                    );
                    break;
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::debug!(target: "entropyd::control", "connection lost: {e}");
                break;
            }
        }
    }
}
