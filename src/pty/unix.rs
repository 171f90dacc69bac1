//! POSIX PTY backend
//!
//! Devices come from `posix_openpt()`; when the host has no pty device
//! (`/dev/ptmx` missing in minimal containers) a pipe pair stands in and the
//! device reports `is_console() == false`.
//!
//! The child is forked from the reaper thread and waited on from the same
//! thread. Everything the child touches between `fork()` and `execve()` is
//! prepared beforehand so the child never allocates. Exec failures travel
//! back to the parent as a raw errno over a close-on-exec pipe.
//!
//! The parent keeps one slave descriptor open per pty until the channel is
//! broken. Without it the master hangs up (EIO) whenever no child has the
//! slave open, which is the normal state of an auxiliary channel between
//! the child's opens.
//!
//! Master reads poll the master together with the channel's "break"
//! self-pipe. Once the break pipe is written it stays readable; the slave
//! hold is dropped at the same time, so pending and future reads return the
//! data still queued on the master and then end-of-stream.
//!
//! # References
//!
//! - posix_openpt(3), grantpt(3), unlockpt(3), ptsname(3)
//! - tty_ioctl(4): https://man7.org/linux/man-pages/man4/tty_ioctl.4.html

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::signal::{kill, killpg};
use nix::sys::termios::{self, SetArg};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{ChannelKind, MasterRead, MasterWrite, PtyBackend, PtyDevice, SpawnRequest};
use crate::error::{Error, Result};
use crate::signal::{ExitStatus, SignalKind};
use crate::size::WindowSize;

/// Signals whose dispositions are reset in the child before exec
const RESET_SIGNALS: [libc::c_int; 7] = [
    libc::SIGCHLD,
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGALRM,
    libc::SIGPIPE,
];

/// How long a read on a broken channel waits for the master to hang up (ms)
const HANGUP_LINGER_MS: libc::c_int = 100;

/// POSIX pty backend
#[derive(Debug, Default)]
pub struct PosixBackend;

impl PosixBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PtyBackend for PosixBackend {
    type Device = PosixDevice;

    fn name(&self) -> &'static str {
        "posix"
    }

    fn allocate(
        &self,
        kind: ChannelKind,
        console: bool,
        size: Option<WindowSize>,
    ) -> Result<PosixDevice> {
        match open_pty() {
            Ok((master, slave_name)) => {
                let path = CString::new(slave_name.as_bytes())
                    .map_err(|e| Error::Allocation(io::Error::new(io::ErrorKind::InvalidData, e)))?;
                let held = prepare_slave(&path, console, size)?;
                let channel = Channel::new(Master::Pty(File::from(master)), Slave::Pty { path, held })
                    .map_err(Error::Allocation)?;
                debug!(slave = %slave_name, ?kind, console, "allocated pty");
                Ok(PosixDevice::new(kind, slave_name, console, channel))
            }
            Err(e) if is_missing_device(&e) => {
                // The child opens the auxiliary slave by name; a pipe has none
                if kind == ChannelKind::Auxiliary {
                    return Err(Error::Configuration(format!(
                        "auxiliary channel needs a pty device: {}",
                        e
                    )));
                }
                warn!(error = %e, ?kind, "no pty device available, falling back to a pipe pair");
                open_pipes(kind)
            }
            Err(e) => Err(Error::Allocation(e)),
        }
    }

    fn execute(&self, request: &SpawnRequest<'_, PosixDevice>) -> Result<u32> {
        let spawn_error = |source: io::Error| Error::Spawn {
            command: request.program.to_string(),
            source,
        };

        let prepared = Prepared::new(request).map_err(spawn_error)?;
        let (report_read, report_write) = cloexec_pipe().map_err(spawn_error)?;

        // SAFETY: the child branch only makes async-signal-safe libc calls on
        // memory prepared before the fork, then execs or _exits.
        match unsafe { fork() } {
            Err(e) => Err(spawn_error(e.into())),
            Ok(ForkResult::Child) => unsafe { exec_child(&prepared, report_write.as_raw_fd()) },
            Ok(ForkResult::Parent { child }) => {
                drop(report_write);
                let mut report = File::from(report_read);
                let mut buf = [0u8; 4];
                let filled = read_report(&mut report, &mut buf).map_err(spawn_error)?;
                if filled == 0 {
                    return Ok(child.as_raw() as u32);
                }

                let errno = if filled == buf.len() {
                    i32::from_ne_bytes(buf)
                } else {
                    libc::EIO
                };
                // The child already _exited; reap it here, on the forking thread
                let _ = waitpid(child, None);
                Err(spawn_error(io::Error::from_raw_os_error(errno)))
            }
        }
    }

    fn wait_for(&self, pid: u32) -> Result<ExitStatus> {
        let pid = to_pid(pid)
            .ok_or_else(|| Error::Wait(io::Error::from_raw_os_error(libc::ESRCH)))?;
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::Exited(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitStatus::Signaled(sig as i32)),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Wait(e.into())),
            }
        }
    }

    fn raise(&self, pid: u32, signal: SignalKind) -> Result<bool> {
        // pid 0 and negative pids would address our own process group
        let Some(target) = to_pid(pid) else {
            return Ok(false);
        };

        let result = match signal.to_signal() {
            None => kill(target, None),
            // The child is a session leader, so its pid is also its process group
            Some(sig) => killpg(target, sig).or_else(|e| {
                if e == Errno::ESRCH {
                    kill(target, sig)
                } else {
                    Err(e)
                }
            }),
        };

        match result {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(Error::Signal(e.into())),
        }
    }
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

fn is_missing_device(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO)
    )
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device released")
}

enum Master {
    Pty(File),
    Pipes { read: File, write: File },
}

impl Master {
    fn read_side(&self) -> &File {
        match self {
            Master::Pty(file) => file,
            Master::Pipes { read, .. } => read,
        }
    }

    fn write_side(&self) -> &File {
        match self {
            Master::Pty(file) => file,
            Master::Pipes { write, .. } => write,
        }
    }
}

/// The parent's hold on the slave side
enum Slave {
    /// Slave path, plus a descriptor that keeps the master from hanging up
    Pty { path: CString, held: OwnedFd },
    /// Child-side pipe ends, dup'd onto stdin/stdout in the child
    Pipes { stdin: OwnedFd, stdout: OwnedFd },
}

/// Descriptors of one device pair, shared by the device and its streams
struct Channel {
    master: Master,
    /// Dropped when the channel breaks
    slave: Mutex<Option<Slave>>,
    broken: AtomicBool,
    wake: Breaker,
}

impl Channel {
    fn new(master: Master, slave: Slave) -> io::Result<Self> {
        Ok(Self {
            master,
            slave: Mutex::new(Some(slave)),
            broken: AtomicBool::new(false),
            wake: Breaker::new()?,
        })
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn break_read(&self) {
        self.broken.store(true, Ordering::Release);
        self.slave.lock().take();
        self.wake.trigger();
    }
}

/// A pty (or pipe-pair) device owned by the lifecycle layer.
///
/// The device and every stream opened on it share one [`Channel`]; its
/// descriptors close when the device is released and the last stream is
/// closed.
pub struct PosixDevice {
    kind: ChannelKind,
    slave_name: String,
    console: bool,
    channel: Mutex<Option<Arc<Channel>>>,
    weak: Weak<Channel>,
}

impl PosixDevice {
    fn new(kind: ChannelKind, slave_name: String, console: bool, channel: Channel) -> Self {
        let channel = Arc::new(channel);
        Self {
            kind,
            slave_name,
            console,
            weak: Arc::downgrade(&channel),
            channel: Mutex::new(Some(channel)),
        }
    }

    /// The channel, unless the device was released
    fn held(&self) -> io::Result<Arc<Channel>> {
        self.channel.lock().clone().ok_or_else(released)
    }

    fn child_slave(&self) -> io::Result<ChildSlave> {
        let channel = self.held()?;
        let slave = channel.slave.lock();
        match slave.as_ref() {
            Some(Slave::Pty { path, .. }) => Ok(ChildSlave::Path(path.clone())),
            Some(Slave::Pipes { stdin, stdout }) => Ok(ChildSlave::Pipes {
                stdin: stdin.as_raw_fd(),
                stdout: stdout.as_raw_fd(),
            }),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "slave side closed")),
        }
    }
}

impl fmt::Debug for PosixDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosixDevice")
            .field("kind", &self.kind)
            .field("slave_name", &self.slave_name)
            .field("console", &self.is_console())
            .field("released", &self.channel.lock().is_none())
            .finish()
    }
}

impl PtyDevice for PosixDevice {
    fn slave_name(&self) -> &str {
        &self.slave_name
    }

    fn is_console(&self) -> bool {
        self.console
    }

    fn open_reader(&self) -> io::Result<Box<dyn MasterRead>> {
        Ok(Box::new(PosixReader {
            channel: self.held()?,
            closed: Breaker::new()?,
        }))
    }

    fn open_writer(&self) -> io::Result<Box<dyn MasterWrite>> {
        Ok(Box::new(PosixWriter {
            channel: self.held()?,
            closed: AtomicBool::new(false),
            wake: Breaker::new()?,
        }))
    }

    fn window_size(&self) -> Result<WindowSize> {
        let channel = self
            .weak
            .upgrade()
            .ok_or_else(|| Error::WindowSize(io::Error::from_raw_os_error(libc::EBADF)))?;
        match &channel.master {
            Master::Pty(file) => get_winsize(file.as_raw_fd()).map_err(Error::WindowSize),
            Master::Pipes { .. } => Err(Error::WindowSize(io::Error::from_raw_os_error(
                libc::ENOTTY,
            ))),
        }
    }

    fn set_window_size(&self, size: WindowSize) -> Result<()> {
        match self.weak.upgrade() {
            Some(channel) => match &channel.master {
                Master::Pty(file) => set_winsize(file.as_raw_fd(), size).map_err(Error::WindowSize),
                // A pipe has no geometry
                Master::Pipes { .. } => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn break_read(&self) {
        trace!(slave = %self.slave_name, "breaking reads");
        if let Some(channel) = self.weak.upgrade() {
            channel.break_read();
        }
    }

    fn release(&self) {
        if self.channel.lock().take().is_some() {
            debug!(slave = %self.slave_name, kind = ?self.kind, "released device");
        }
    }
}

fn open_pty() -> io::Result<(OwnedFd, String)> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let slave_name = slave_name(&master)?;

    // SAFETY: into_raw_fd hands us sole ownership of the descriptor
    let fd = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    set_cloexec(fd.as_raw_fd())?;
    set_nonblocking(fd.as_raw_fd())?;
    Ok((fd, slave_name))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    nix::pty::ptsname_r(master)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    static PTSNAME_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());
    let _guard = PTSNAME_LOCK.lock();
    // SAFETY: ptsname's static buffer is only touched while PTSNAME_LOCK is held
    unsafe { nix::pty::ptsname(master) }
}

/// Open the slave in the parent, set line discipline and geometry before the
/// child exists, and keep the descriptor as the parent's hold.
fn prepare_slave(path: &CStr, console: bool, size: Option<WindowSize>) -> Result<OwnedFd> {
    // SAFETY: path is a valid NUL-terminated string
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Allocation(io::Error::last_os_error()));
    }
    // SAFETY: fd was just returned by open
    let slave = unsafe { OwnedFd::from_raw_fd(fd) };

    if console {
        let mut attrs =
            termios::tcgetattr(slave.as_fd()).map_err(|e| Error::Allocation(e.into()))?;
        attrs.local_flags &= !(termios::LocalFlags::ECHO | termios::LocalFlags::ECHONL);
        termios::tcsetattr(slave.as_fd(), SetArg::TCSANOW, &attrs)
            .map_err(|e| Error::Allocation(e.into()))?;
    }

    if let Some(size) = size {
        // Through the slave: some platforms reject TIOCSWINSZ on a master
        // whose slave has never been opened
        set_winsize(slave.as_raw_fd(), size).map_err(Error::WindowSize)?;
    }
    Ok(slave)
}

fn open_pipes(kind: ChannelKind) -> Result<PosixDevice> {
    let (child_stdin, parent_write) = cloexec_pipe().map_err(Error::Allocation)?;
    let (parent_read, child_stdout) = cloexec_pipe().map_err(Error::Allocation)?;
    set_nonblocking(parent_write.as_raw_fd()).map_err(|e| Error::Allocation(e.into()))?;
    set_nonblocking(parent_read.as_raw_fd()).map_err(|e| Error::Allocation(e.into()))?;

    let slave_name = format!(
        "pipe:{}:{}",
        child_stdin.as_raw_fd(),
        child_stdout.as_raw_fd()
    );
    let channel = Channel::new(
        Master::Pipes {
            read: File::from(parent_read),
            write: File::from(parent_write),
        },
        Slave::Pipes {
            stdin: child_stdin,
            stdout: child_stdout,
        },
    )
    .map_err(Error::Allocation)?;
    Ok(PosixDevice::new(kind, slave_name, false, channel))
}

fn set_winsize(fd: RawFd, size: WindowSize) -> io::Result<()> {
    let ws = size.to_winsize();
    // SAFETY: TIOCSWINSZ reads a winsize that outlives the call
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &ws) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn get_winsize(fd: RawFd) -> io::Result<WindowSize> {
    // SAFETY: winsize is plain old data
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ writes into ws, which outlives the call
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut ws) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(WindowSize::from(ws))
    }
}

fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: pipe writes two descriptors into fds
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

fn read_report(file: &mut File, buf: &mut [u8; 4]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Self-pipe that stays readable once triggered
struct Breaker {
    read: OwnedFd,
    write: OwnedFd,
}

impl Breaker {
    fn new() -> io::Result<Self> {
        let (read, write) = cloexec_pipe()?;
        set_nonblocking(write.as_raw_fd())?;
        Ok(Self { read, write })
    }

    fn trigger(&self) {
        let byte = 1u8;
        // SAFETY: one byte from a live stack value; a full pipe is already triggered
        let _ = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
    }

    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Wait for an event on any descriptor; `timeout_ms < 0` waits forever
fn poll_fds(fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: fds is a valid, exclusively borrowed pollfd array
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// One read attempt on the master; `None` when nothing was ready after all
fn read_master(master: &File, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut file = master;
    match file.read(buf) {
        Ok(n) => Ok(Some(n)),
        // A hung-up pty master reports EIO instead of EOF
        Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(Some(0)),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

struct PosixReader {
    channel: Arc<Channel>,
    closed: Breaker,
}

impl PosixReader {
    /// The channel broke with nothing queued. Its slave hold is gone, so the
    /// master hangs up as soon as no child has the slave open either.
    fn read_after_break(&self, buf: &mut [u8]) -> io::Result<usize> {
        let master = self.channel.master.read_side();
        let mut fds = [
            pollfd(master.as_raw_fd(), libc::POLLIN),
            pollfd(self.closed.as_raw_fd(), libc::POLLIN),
        ];
        poll_fds(&mut fds, HANGUP_LINGER_MS)?;
        if fds[1].revents != 0 || fds[0].revents == 0 {
            return Ok(0);
        }
        Ok(read_master(master, buf)?.unwrap_or(0))
    }
}

impl MasterRead for PosixReader {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let master = self.channel.master.read_side();
        loop {
            let mut fds = [
                pollfd(master.as_raw_fd(), libc::POLLIN),
                pollfd(self.channel.wake.as_raw_fd(), libc::POLLIN),
                pollfd(self.closed.as_raw_fd(), libc::POLLIN),
            ];
            poll_fds(&mut fds, -1)?;

            if fds[2].revents != 0 {
                return Ok(0);
            }

            // Queued data wins over a break
            if fds[0].revents != 0 {
                if let Some(n) = read_master(master, buf)? {
                    return Ok(n);
                }
            }

            if fds[1].revents != 0 && fds[0].revents & libc::POLLIN == 0 {
                return self.read_after_break(buf);
            }
        }
    }

    fn close(&self) {
        self.closed.trigger();
    }
}

struct PosixWriter {
    channel: Arc<Channel>,
    closed: AtomicBool,
    wake: Breaker,
}

impl MasterWrite for PosixWriter {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut master = self.channel.master.write_side();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
            }
            match master.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Nobody will drain a full buffer once the channel is broken
                    if self.channel.is_broken() {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
                    }
                    let mut fds = [
                        pollfd(master.as_raw_fd(), libc::POLLOUT),
                        pollfd(self.wake.as_raw_fd(), libc::POLLIN),
                        pollfd(self.channel.wake.as_raw_fd(), libc::POLLIN),
                    ];
                    poll_fds(&mut fds, -1)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.trigger();
    }
}

/// Slave as the forked child sees it
enum ChildSlave {
    Path(CString),
    Pipes { stdin: RawFd, stdout: RawFd },
}

/// Everything the forked child touches, built before fork so the child never allocates
struct Prepared {
    program: CString,
    _argv: Vec<CString>,
    argv: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp: Vec<*const libc::c_char>,
    directory: CString,
    primary: ChildSlave,
    error: Option<ChildSlave>,
}

impl Prepared {
    fn new(request: &SpawnRequest<'_, PosixDevice>) -> io::Result<Self> {
        let program = cstring(request.program.as_bytes())?;
        let argv_owned = request
            .argv
            .iter()
            .map(|arg| cstring(arg.as_bytes()))
            .collect::<io::Result<Vec<_>>>()?;
        let envp_owned = env_entries(request.envp)
            .into_iter()
            .map(|entry| cstring(entry.as_bytes()))
            .collect::<io::Result<Vec<_>>>()?;
        let directory = cstring(request.directory.as_os_str().as_bytes())?;

        // Moving the Vec<CString> below does not move the string buffers
        let argv = null_terminated(&argv_owned);
        let envp = null_terminated(&envp_owned);

        Ok(Self {
            program,
            _argv: argv_owned,
            argv,
            _envp: envp_owned,
            envp,
            directory,
            primary: request.primary.child_slave()?,
            error: request.error.map(PosixDevice::child_slave).transpose()?,
        })
    }
}

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn env_entries(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Runs in the forked child. Only async-signal-safe calls from here on.
unsafe fn exec_child(p: &Prepared, report: RawFd) -> ! {
    if libc::setsid() < 0 {
        child_fail(report);
    }

    let (stdin_fd, stdout_fd) = match &p.primary {
        ChildSlave::Path(path) => {
            // Opening a tty without O_NOCTTY from a session leader makes it
            // the controlling terminal on Linux; BSDs need TIOCSCTTY.
            let fd = libc::open(path.as_ptr(), libc::O_RDWR);
            if fd < 0 {
                child_fail(report);
            }
            libc::ioctl(fd, libc::TIOCSCTTY as _, 0);
            (fd, fd)
        }
        ChildSlave::Pipes { stdin, stdout } => (*stdin, *stdout),
    };

    let stderr_fd = match &p.error {
        Some(ChildSlave::Path(path)) => {
            let fd = libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY);
            if fd < 0 {
                child_fail(report);
            }
            fd
        }
        Some(ChildSlave::Pipes { stdout, .. }) => *stdout,
        None => stdout_fd,
    };

    if libc::dup2(stdin_fd, libc::STDIN_FILENO) < 0
        || libc::dup2(stdout_fd, libc::STDOUT_FILENO) < 0
        || libc::dup2(stderr_fd, libc::STDERR_FILENO) < 0
    {
        child_fail(report);
    }
    for fd in [stdin_fd, stdout_fd, stderr_fd] {
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }

    if libc::chdir(p.directory.as_ptr()) < 0 {
        child_fail(report);
    }

    for sig in RESET_SIGNALS {
        libc::signal(sig, libc::SIG_DFL);
    }
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());

    libc::execve(p.program.as_ptr(), p.argv.as_ptr(), p.envp.as_ptr());
    child_fail(report)
}

/// Report errno to the parent and leave without running destructors
unsafe fn child_fail(report: RawFd) -> ! {
    let errno = io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL);
    let bytes = errno.to_ne_bytes();
    libc::write(report, bytes.as_ptr() as *const libc::c_void, bytes.len());
    libc::_exit(127)
}
