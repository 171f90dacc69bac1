//! The handle to a running child and its lifecycle state machine
//!
//! ```text
//! Starting ──spawn ok──▶ Running ──exit observed──▶ Terminated
//!     └────spawn error──▶ Failed
//! ```
//!
//! Only the reaper thread moves the state forward. Every handle operation
//! reads the state under the same lock, so a caller never sees a pid
//! without a Running state or an exit status without Terminated.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::channel::PtyChannelSet;
use crate::error::{Error, Result};
use crate::pty::{Backend, PtyBackend};
use crate::signal::{ExitStatus, SignalKind};
use crate::size::WindowSize;
use crate::stream::{PtyReader, PtyWriter, StreamSlots};

/// How long [`PtyProcess::request_stop`] waits after terminate before killing
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1000);

/// Lifecycle state of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Devices allocated, child not yet executed
    Starting,
    /// The child exists and has not been reaped
    Running,
    /// The child exited and its status is recorded
    Terminated,
    /// The child could not be started
    Failed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Terminated => "terminated",
            ProcessState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub(crate) struct Lifecycle {
    state: ProcessState,
    pid: Option<u32>,
    status: Option<ExitStatus>,
    spawn_error: Option<Error>,
    streams: StreamSlots,
}

/// State shared between the handle and the reaper thread
pub(crate) struct Shared<B: PtyBackend> {
    pub(crate) backend: B,
    pub(crate) channels: PtyChannelSet<B::Device>,
    pub(crate) command: String,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

impl<B: PtyBackend> Shared<B> {
    pub(crate) fn new(backend: B, channels: PtyChannelSet<B::Device>, command: String) -> Self {
        Self {
            backend,
            channels,
            command,
            lifecycle: Mutex::new(Lifecycle {
                state: ProcessState::Starting,
                pid: None,
                status: None,
                spawn_error: None,
                streams: StreamSlots::default(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock()
    }

    /// Record the outcome of the execute primitive. Reaper only.
    pub(crate) fn publish_spawn(&self, result: Result<u32>) {
        let mut lc = self.lock();
        debug_assert_eq!(lc.state, ProcessState::Starting);
        match result {
            Ok(pid) => {
                lc.pid = Some(pid);
                lc.state = ProcessState::Running;
            }
            Err(e) => {
                lc.spawn_error = Some(e);
                lc.state = ProcessState::Failed;
            }
        }
        self.changed.notify_all();
    }

    /// Record the exit status. Reaper only.
    pub(crate) fn publish_exit(&self, status: ExitStatus) {
        let mut lc = self.lock();
        debug_assert_eq!(lc.state, ProcessState::Running);
        lc.status = Some(status);
        lc.state = ProcessState::Terminated;
        self.changed.notify_all();
    }

    /// Block until the child left Starting; the pid, or the spawn error
    pub(crate) fn wait_started(&self) -> Result<u32> {
        let mut lc = self.lock();
        while lc.state == ProcessState::Starting {
            self.changed.wait(&mut lc);
        }
        if lc.state == ProcessState::Failed {
            return Err(lc
                .spawn_error
                .take()
                .unwrap_or(Error::IllegalState("spawn already failed")));
        }
        lc.pid
            .ok_or(Error::IllegalState("running process without a pid"))
    }
}

/// A child process attached to a pseudoterminal.
///
/// The handle is `Sync`: any number of threads may wait, signal, resize and
/// use streams concurrently. Dropping it closes streams nobody requested but
/// does not kill the child; use [`destroy`](Self::destroy) for that.
pub struct PtyProcess<B: PtyBackend = Backend> {
    shared: Arc<Shared<B>>,
    pid: u32,
    grace: Duration,
}

impl<B: PtyBackend> PtyProcess<B> {
    pub(crate) fn new(shared: Arc<Shared<B>>, pid: u32) -> Self {
        Self {
            shared,
            pid,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Change how long [`request_stop`](Self::request_stop) waits before killing
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.shared.lock().state
    }

    /// The command line the child was started with
    pub fn command(&self) -> &str {
        &self.shared.command
    }

    pub fn channels(&self) -> &PtyChannelSet<B::Device> {
        &self.shared.channels
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Block until the child exits. Every caller sees the same status.
    pub fn wait_for(&self) -> ExitStatus {
        let mut lc = self.shared.lock();
        loop {
            if let Some(status) = lc.status {
                return status;
            }
            self.shared.changed.wait(&mut lc);
        }
    }

    /// Like [`wait_for`](Self::wait_for) but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        let mut lc = self.shared.lock();
        loop {
            if let Some(status) = lc.status {
                return Some(status);
            }
            if self.shared.changed.wait_until(&mut lc, deadline).timed_out() {
                return lc.status;
            }
        }
    }

    /// Exit status of a terminated child
    pub fn exit_status(&self) -> Result<ExitStatus> {
        self.shared
            .lock()
            .status
            .ok_or(Error::IllegalState("process has not terminated"))
    }

    /// Exit status if the child has terminated, without blocking
    pub fn try_status(&self) -> Option<ExitStatus> {
        self.shared.lock().status
    }

    /// Deliver a control to the child's process group.
    ///
    /// `Ok(false)` when the child is not running (including before it ever
    /// ran) or disappeared before delivery.
    pub fn signal(&self, signal: SignalKind) -> Result<bool> {
        if self.state() != ProcessState::Running {
            return Ok(false);
        }
        // Raised without the lock: delivery may block (the Windows interrupt
        // writes into the child's input). A child reaped meanwhile is ESRCH.
        let delivered = self.shared.backend.raise(self.pid, signal)?;
        if signal != SignalKind::Liveness {
            debug!(pid = self.pid, %signal, delivered, "signal");
        }
        Ok(delivered)
    }

    /// Liveness check: true only while the child is running and reachable
    pub fn is_running(&self) -> bool {
        matches!(self.signal(SignalKind::Liveness), Ok(true))
    }

    pub fn hangup(&self) -> Result<bool> {
        self.signal(SignalKind::Hangup)
    }

    pub fn interrupt(&self) -> Result<bool> {
        self.signal(SignalKind::Interrupt)
    }

    pub fn terminate(&self) -> Result<bool> {
        self.signal(SignalKind::Terminate)
    }

    pub fn kill(&self) -> Result<bool> {
        self.signal(SignalKind::Kill)
    }

    /// Resize every channel, then notify the child once.
    ///
    /// Rejected while starting; a no-op once the child has terminated.
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        {
            let lc = self.shared.lock();
            match lc.state {
                ProcessState::Starting => {
                    return Err(Error::IllegalState("process has not started"))
                }
                ProcessState::Terminated | ProcessState::Failed => return Ok(()),
                ProcessState::Running => self.shared.channels.set_window_size(size)?,
            }
        }
        self.shared.backend.raise(self.pid, SignalKind::WindowChange)?;
        debug!(pid = self.pid, cols = size.cols, rows = size.rows, "resized");
        Ok(())
    }

    /// Current size of the primary channel
    pub fn window_size(&self) -> Result<WindowSize> {
        self.shared.channels.window_size()
    }

    /// Terminate, wait out the grace period, then kill.
    ///
    /// Returns the exit status once the child is gone.
    pub fn request_stop(&self) -> Result<ExitStatus> {
        if let Some(status) = self.try_status() {
            return Ok(status);
        }
        self.terminate()?;
        if let Some(status) = self.wait_timeout(self.grace) {
            return Ok(status);
        }
        warn!(pid = self.pid, grace = ?self.grace, "child ignored terminate, killing");
        self.kill()?;
        Ok(self.wait_for())
    }

    /// Close every stream nobody requested and release the devices, then stop the child
    pub fn destroy(&self) -> Result<ExitStatus> {
        self.drain_streams();
        self.request_stop()
    }

    /// Stream carrying the child's stdout (and stderr unless it has its own channel)
    pub fn reader(&self) -> Result<Arc<PtyReader>> {
        let mut lc = self.shared.lock();
        Ok(lc.streams.reader(&self.shared.channels)?)
    }

    /// Stream feeding the child's stdin
    pub fn writer(&self) -> Result<Arc<PtyWriter>> {
        let mut lc = self.shared.lock();
        Ok(lc.streams.writer(&self.shared.channels)?)
    }

    /// The child's stderr; an always-empty stream unless stderr has its own channel
    pub fn error_reader(&self) -> Result<Arc<PtyReader>> {
        let mut lc = self.shared.lock();
        Ok(lc.streams.error_reader(&self.shared.channels)?)
    }

    /// Reading side of the auxiliary channel, if one was allocated
    pub fn aux_reader(&self) -> Result<Option<Arc<PtyReader>>> {
        let mut lc = self.shared.lock();
        Ok(lc.streams.aux_reader(&self.shared.channels)?)
    }

    /// Writing side of the auxiliary channel, if one was allocated
    pub fn aux_writer(&self) -> Result<Option<Arc<PtyWriter>>> {
        let mut lc = self.shared.lock();
        Ok(lc.streams.aux_writer(&self.shared.channels)?)
    }

    fn drain_streams(&self) {
        let mut lc = self.shared.lock();
        lc.streams.drain(&self.shared.channels);
    }
}

impl<B: PtyBackend> Drop for PtyProcess<B> {
    fn drop(&mut self) {
        self.drain_streams();
    }
}

impl<B: PtyBackend> fmt::Debug for PtyProcess<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("backend", &self.shared.backend.name())
            .field("command", &self.shared.command)
            .field("state", &self.state())
            .finish()
    }
}
