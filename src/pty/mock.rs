//! Scripted in-memory backend for lifecycle tests

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{ChannelKind, MasterRead, MasterWrite, PtyBackend, PtyDevice, SpawnRequest};
use crate::error::{Error, Result};
use crate::signal::{ExitStatus, SignalKind};
use crate::size::WindowSize;

/// Something the backend was asked to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Allocate(ChannelKind, Option<WindowSize>),
    Spawn {
        argv: Vec<String>,
        error: bool,
        auxiliary: bool,
    },
    Resize(ChannelKind, WindowSize),
    Signal(SignalKind),
}

#[derive(Default)]
struct State {
    events: Vec<Event>,
    exit: Option<ExitStatus>,
    fail_wait: bool,
    signals_released: bool,
}

#[derive(Default)]
struct Script {
    state: Mutex<State>,
    exited: Condvar,
}

impl Script {
    fn record(&self, event: Event) {
        self.state.lock().events.push(event);
    }

    fn exit(&self, status: ExitStatus) {
        let mut state = self.state.lock();
        if state.exit.is_none() {
            state.exit = Some(status);
        }
        self.exited.notify_all();
    }
}

/// Test-side view of a [`MockBackend`] that has been moved into a process
#[derive(Clone)]
pub(crate) struct MockHandle {
    script: Arc<Script>,
}

impl MockHandle {
    /// Make the child exit
    pub(crate) fn exit(&self, status: ExitStatus) {
        self.script.exit(status);
    }

    /// Make the pending wait fail instead of reporting a status
    pub(crate) fn fail_wait(&self) {
        let mut state = self.script.state.lock();
        state.fail_wait = true;
        self.script.exited.notify_all();
    }

    /// Let signal deliveries held by `block_signals` through
    pub(crate) fn release_signals(&self) {
        let mut state = self.script.state.lock();
        state.signals_released = true;
        self.script.exited.notify_all();
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.script.state.lock().events.clone()
    }

    pub(crate) fn signals(&self) -> Vec<SignalKind> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Signal(kind) => Some(kind),
                _ => None,
            })
            .collect()
    }
}

/// Backend whose child is a script driven by the test
pub(crate) struct MockBackend {
    pub(crate) fail_spawn: bool,
    pub(crate) ignore_terminate: bool,
    pub(crate) auxiliary: bool,
    pub(crate) error_channel: bool,
    pub(crate) console: bool,
    pub(crate) spawn_delay: Duration,
    /// `raise` blocks until [`MockHandle::release_signals`]
    pub(crate) block_signals: bool,
    next_pid: AtomicU32,
    script: Arc<Script>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self {
            fail_spawn: false,
            ignore_terminate: false,
            auxiliary: true,
            error_channel: true,
            console: true,
            spawn_delay: Duration::ZERO,
            block_signals: false,
            next_pid: AtomicU32::new(4242),
            script: Arc::default(),
        }
    }

    pub(crate) fn handle(&self) -> MockHandle {
        MockHandle {
            script: Arc::clone(&self.script),
        }
    }
}

impl PtyBackend for MockBackend {
    type Device = MockDevice;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_error_channel(&self) -> bool {
        self.error_channel
    }

    fn supports_auxiliary(&self) -> bool {
        self.auxiliary
    }

    fn allocate(
        &self,
        kind: ChannelKind,
        console: bool,
        size: Option<WindowSize>,
    ) -> Result<MockDevice> {
        self.script.record(Event::Allocate(kind, size));
        Ok(MockDevice {
            kind,
            console: console && self.console,
            shared: Arc::new(DeviceShared {
                size: Mutex::new(size.unwrap_or_default()),
                pipe: Mutex::new(Pipe::default()),
                readable: Condvar::new(),
            }),
            released: AtomicBool::new(false),
            script: Arc::clone(&self.script),
        })
    }

    fn execute(&self, request: &SpawnRequest<'_, MockDevice>) -> Result<u32> {
        if !self.spawn_delay.is_zero() {
            std::thread::sleep(self.spawn_delay);
        }
        if self.fail_spawn {
            return Err(Error::Spawn {
                command: request.program.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        self.script.record(Event::Spawn {
            argv: request.argv.to_vec(),
            error: request.error.is_some(),
            auxiliary: request.auxiliary.is_some(),
        });
        Ok(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    fn wait_for(&self, _pid: u32) -> Result<ExitStatus> {
        let mut state = self.script.state.lock();
        loop {
            if let Some(status) = state.exit {
                return Ok(status);
            }
            if state.fail_wait {
                return Err(Error::Wait(io::Error::from(io::ErrorKind::Other)));
            }
            self.script.exited.wait(&mut state);
        }
    }

    fn raise(&self, _pid: u32, signal: SignalKind) -> Result<bool> {
        let mut state = self.script.state.lock();
        while self.block_signals && !state.signals_released {
            self.script.exited.wait(&mut state);
        }
        if state.exit.is_some() {
            return Ok(false);
        }
        state.events.push(Event::Signal(signal));
        let status = match signal {
            SignalKind::Terminate if self.ignore_terminate => None,
            SignalKind::Terminate => Some(ExitStatus::Signaled(15)),
            SignalKind::Kill => Some(ExitStatus::Signaled(9)),
            SignalKind::Hangup => Some(ExitStatus::Signaled(1)),
            SignalKind::Interrupt => Some(ExitStatus::Signaled(2)),
            SignalKind::Liveness | SignalKind::WindowChange => None,
        };
        if let Some(status) = status {
            state.exit = Some(status);
            self.script.exited.notify_all();
        }
        Ok(true)
    }
}

#[derive(Default)]
struct Pipe {
    /// Bytes the "child" wrote, waiting for the master reader
    output: VecDeque<u8>,
    /// Bytes written through the master
    input: Vec<u8>,
    broken: bool,
}

struct DeviceShared {
    size: Mutex<WindowSize>,
    pipe: Mutex<Pipe>,
    readable: Condvar,
}

/// In-memory device pair
pub(crate) struct MockDevice {
    kind: ChannelKind,
    console: bool,
    shared: Arc<DeviceShared>,
    released: AtomicBool,
    script: Arc<Script>,
}

impl MockDevice {
    /// Queue bytes as if the child had written them to the slave
    pub(crate) fn feed(&self, bytes: &[u8]) {
        self.shared.pipe.lock().output.extend(bytes);
        self.shared.readable.notify_all();
    }

    /// Everything written through the master so far
    pub(crate) fn written(&self) -> Vec<u8> {
        self.shared.pipe.lock().input.clone()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Streams currently holding this device's pipe
    pub(crate) fn open_streams(&self) -> usize {
        Arc::strong_count(&self.shared) - 1
    }

    fn check_held(&self) -> io::Result<()> {
        if self.is_released() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        Ok(())
    }
}

impl PtyDevice for MockDevice {
    fn slave_name(&self) -> &str {
        match self.kind {
            ChannelKind::Primary => "mock:primary",
            ChannelKind::Error => "mock:error",
            ChannelKind::Auxiliary => "mock:aux",
        }
    }

    fn is_console(&self) -> bool {
        self.console
    }

    fn open_reader(&self) -> io::Result<Box<dyn MasterRead>> {
        self.check_held()?;
        Ok(Box::new(MockReader {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }

    fn open_writer(&self) -> io::Result<Box<dyn MasterWrite>> {
        self.check_held()?;
        Ok(Box::new(MockWriter {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }

    fn window_size(&self) -> Result<WindowSize> {
        Ok(*self.shared.size.lock())
    }

    fn set_window_size(&self, size: WindowSize) -> Result<()> {
        *self.shared.size.lock() = size;
        self.script.record(Event::Resize(self.kind, size));
        Ok(())
    }

    fn break_read(&self) {
        self.shared.pipe.lock().broken = true;
        self.shared.readable.notify_all();
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

struct MockReader {
    shared: Arc<DeviceShared>,
    closed: AtomicBool,
}

impl MasterRead for MockReader {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.shared.pipe.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            if !pipe.output.is_empty() {
                let n = buf.len().min(pipe.output.len());
                for (slot, byte) in buf.iter_mut().zip(pipe.output.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if pipe.broken {
                return Ok(0);
            }
            self.shared.readable.wait(&mut pipe);
        }
    }

    fn close(&self) {
        // Store under the lock so a reader between its check and its wait sees it
        let _pipe = self.shared.pipe.lock();
        self.closed.store(true, Ordering::Release);
        self.shared.readable.notify_all();
    }
}

struct MockWriter {
    shared: Arc<DeviceShared>,
    closed: AtomicBool,
}

impl MasterWrite for MockWriter {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.shared.pipe.lock().input.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
