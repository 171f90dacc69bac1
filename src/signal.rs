//! Control signals that can be raised against a spawned child

use std::fmt;

/// A control sent to the child's process group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// SIGHUP
    Hangup,
    /// SIGINT (Ctrl-C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
    /// Signal 0: checks that the process exists without affecting it
    Liveness,
    /// SIGWINCH
    WindowChange,
}

impl SignalKind {
    /// The POSIX signal for this kind; `None` for the liveness check
    #[cfg(unix)]
    pub fn to_signal(self) -> Option<nix::sys::signal::Signal> {
        use nix::sys::signal::Signal;
        match self {
            SignalKind::Hangup => Some(Signal::SIGHUP),
            SignalKind::Interrupt => Some(Signal::SIGINT),
            SignalKind::Terminate => Some(Signal::SIGTERM),
            SignalKind::Kill => Some(Signal::SIGKILL),
            SignalKind::Liveness => None,
            SignalKind::WindowChange => Some(Signal::SIGWINCH),
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Hangup => "hangup",
            SignalKind::Interrupt => "interrupt",
            SignalKind::Terminate => "terminate",
            SignalKind::Kill => "kill",
            SignalKind::Liveness => "liveness",
            SignalKind::WindowChange => "window-change",
        };
        f.write_str(name)
    }
}

/// How a child left the Running state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with a status code
    Exited(i32),
    /// Killed by a signal
    Signaled(i32),
    /// The native wait failed, so the real status was lost
    Unknown,
}

impl ExitStatus {
    /// Exit code in shell convention (128 + signal for signaled children, -1 when unknown)
    pub fn code(&self) -> i32 {
        match *self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(sig) => 128 + sig,
            ExitStatus::Unknown => -1,
        }
    }

    /// The terminating signal, if any
    pub fn signal(&self) -> Option<i32> {
        match *self {
            ExitStatus::Signaled(sig) => Some(sig),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit status {}", code),
            ExitStatus::Signaled(sig) => write!(f, "killed by signal {}", sig),
            ExitStatus::Unknown => f.write_str("unknown exit status"),
        }
    }
}
