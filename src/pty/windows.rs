//! Windows backends
//!
//! `ConsoleHostBackend` attaches the child to a pseudo console (ConPTY,
//! Windows 10 1809+). Its auxiliary channel is a duplex named pipe whose name
//! is handed to the child. `LegacyBackend` wires the child's std handles to
//! anonymous pipes; it has no console, no geometry and no auxiliary channel.
//!
//! Process handles are kept in a pid-keyed table until the wait completes.
//! A pipe whose other end went away reports `ERROR_BROKEN_PIPE`, which reads
//! as end-of-stream.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};
use windows_sys::Win32::Foundation::{
    SetHandleInformation, ERROR_NO_DATA, ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
    HANDLE_FLAG_INHERIT, INVALID_HANDLE_VALUE, S_OK, WAIT_FAILED, WAIT_TIMEOUT,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_FIRST_PIPE_INSTANCE, OPEN_EXISTING, PIPE_ACCESS_DUPLEX,
};
use windows_sys::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, CreatePipe, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE,
    PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject, CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT,
    EXTENDED_STARTUPINFO_PRESENT, INFINITE, LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION,
    PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE, STARTF_USESTDHANDLES, STARTUPINFOEXW,
};
use windows_sys::Win32::System::IO::CancelIoEx;

use super::{ChannelKind, MasterRead, MasterWrite, PtyBackend, PtyDevice, SpawnRequest};
use crate::error::{Error, Result};
use crate::signal::{ExitStatus, SignalKind};
use crate::size::WindowSize;
use crate::stream::BrokenPipeAsEof;

/// Interrupt character delivered instead of a console control event
const CTRL_C: u8 = 0x03;

/// Exit code given to children stopped through `TerminateProcess`
const TERMINATED_EXIT_CODE: u32 = 1;

const PIPE_BUFFER: u32 = 64 * 1024;

static PIPE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// ConPTY backend
#[derive(Debug, Default)]
pub struct ConsoleHostBackend {
    processes: ProcessTable,
}

impl ConsoleHostBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PtyBackend for ConsoleHostBackend {
    type Device = WinDevice;

    fn name(&self) -> &'static str {
        "conpty"
    }

    /// conhost merges stderr into the console output
    fn supports_error_channel(&self) -> bool {
        false
    }

    fn allocate(
        &self,
        kind: ChannelKind,
        _console: bool,
        size: Option<WindowSize>,
    ) -> Result<WinDevice> {
        let size = size.unwrap_or_default();
        match kind {
            ChannelKind::Auxiliary => WinDevice::named_pipe(kind, size),
            _ => WinDevice::pseudo_console(kind, size),
        }
    }

    fn execute(&self, request: &SpawnRequest<'_, WinDevice>) -> Result<u32> {
        let hpcon = request
            .primary
            .pseudo_console()
            .ok_or_else(|| spawn_error(request, io::ErrorKind::InvalidInput.into()))?;

        let mut attributes = AttributeList::new(hpcon).map_err(|e| spawn_error(request, e))?;

        // SAFETY: STARTUPINFOEXW is plain old data
        let mut si: STARTUPINFOEXW = unsafe { mem::zeroed() };
        si.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        // Without this the child may pick up our own std handles instead of the console
        si.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        si.StartupInfo.hStdInput = INVALID_HANDLE_VALUE;
        si.StartupInfo.hStdOutput = INVALID_HANDLE_VALUE;
        si.StartupInfo.hStdError = INVALID_HANDLE_VALUE;
        si.lpAttributeList = attributes.as_ptr();

        let pid = create_process(
            request,
            &si.StartupInfo,
            false,
            EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
            &self.processes,
        )?;
        drop(attributes);
        Ok(pid)
    }

    fn wait_for(&self, pid: u32) -> Result<ExitStatus> {
        self.processes.wait(pid)
    }

    fn raise(&self, pid: u32, signal: SignalKind) -> Result<bool> {
        self.processes.raise(pid, signal)
    }
}

/// Pipe-backed emulation for hosts without a usable pseudo console
#[derive(Debug, Default)]
pub struct LegacyBackend {
    processes: ProcessTable,
}

impl LegacyBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PtyBackend for LegacyBackend {
    type Device = WinDevice;

    fn name(&self) -> &'static str {
        "legacy"
    }

    fn supports_error_channel(&self) -> bool {
        false
    }

    fn supports_auxiliary(&self) -> bool {
        false
    }

    fn allocate(
        &self,
        kind: ChannelKind,
        _console: bool,
        size: Option<WindowSize>,
    ) -> Result<WinDevice> {
        WinDevice::anonymous_pipes(kind, size.unwrap_or_default())
    }

    fn execute(&self, request: &SpawnRequest<'_, WinDevice>) -> Result<u32> {
        let (stdin, stdout) = request
            .primary
            .child_ends()
            .ok_or_else(|| spawn_error(request, io::ErrorKind::InvalidInput.into()))?;

        // SAFETY: STARTUPINFOEXW is plain old data
        let mut si: STARTUPINFOEXW = unsafe { mem::zeroed() };
        si.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        si.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        si.StartupInfo.hStdInput = stdin;
        si.StartupInfo.hStdOutput = stdout;
        si.StartupInfo.hStdError = stdout;

        let pid = create_process(
            request,
            &si.StartupInfo,
            true,
            CREATE_UNICODE_ENVIRONMENT | CREATE_NO_WINDOW,
            &self.processes,
        )?;
        // The child has its copies; ours would keep the output pipe open forever
        request.primary.release_child_ends();
        Ok(pid)
    }

    fn wait_for(&self, pid: u32) -> Result<ExitStatus> {
        self.processes.wait(pid)
    }

    fn raise(&self, pid: u32, signal: SignalKind) -> Result<bool> {
        self.processes.raise(pid, signal)
    }
}

fn spawn_error(request: &SpawnRequest<'_, WinDevice>, source: io::Error) -> Error {
    Error::Spawn {
        command: request.program.to_string(),
        source,
    }
}

fn create_process(
    request: &SpawnRequest<'_, WinDevice>,
    startup: *const windows_sys::Win32::System::Threading::STARTUPINFOW,
    inherit_handles: bool,
    flags: u32,
    processes: &ProcessTable,
) -> Result<u32> {
    let mut cmd = wide(OsStr::new(&command_line(request.argv)));
    let environment = environment_block(request.envp);
    let directory = wide(request.directory.as_os_str());
    let input = request
        .primary
        .input_file()
        .map_err(|e| spawn_error(request, e))?;

    // SAFETY: PROCESS_INFORMATION is plain old data
    let mut pi: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    // SAFETY: every pointer refers to a live, NUL-terminated buffer for the call
    let ok = unsafe {
        CreateProcessW(
            ptr::null(),
            cmd.as_mut_ptr(),
            ptr::null(),
            ptr::null(),
            inherit_handles as i32,
            flags,
            environment.as_ptr() as *const _,
            directory.as_ptr(),
            startup,
            &mut pi,
        )
    };
    if ok == 0 {
        return Err(spawn_error(request, io::Error::last_os_error()));
    }

    // SAFETY: CreateProcessW handed us both handles
    let (process, _thread) = unsafe {
        (
            OwnedHandle::from_raw_handle(pi.hProcess as RawHandle),
            OwnedHandle::from_raw_handle(pi.hThread as RawHandle),
        )
    };
    processes.insert(pi.dwProcessId, process, input);
    debug!(pid = pi.dwProcessId, program = request.program, "created process");
    Ok(pi.dwProcessId)
}

/// Owned `PROC_THREAD_ATTRIBUTE_LIST` carrying the pseudo console
struct AttributeList {
    buf: Vec<u8>,
}

impl AttributeList {
    fn new(hpcon: HPCON) -> io::Result<Self> {
        let mut size: usize = 0;
        // SAFETY: the sizing call writes only `size`
        unsafe { InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut size) };
        let mut list = Self { buf: vec![0u8; size] };
        // SAFETY: buf is `size` bytes long
        if unsafe { InitializeProcThreadAttributeList(list.as_ptr(), 1, 0, &mut size) } == 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the pseudo console attribute takes the HPCON value itself
        let ok = unsafe {
            UpdateProcThreadAttribute(
                list.as_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE as usize,
                hpcon as *const _,
                mem::size_of::<HPCON>(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(list)
    }

    fn as_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.buf.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        // SAFETY: initialized in new()
        unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
    }
}

struct ProcessEntry {
    handle: OwnedHandle,
    /// Primary input, for delivering the interrupt character
    input: Arc<File>,
}

impl ProcessEntry {
    fn raw(&self) -> HANDLE {
        self.handle.as_raw_handle() as HANDLE
    }

    fn has_exited(&self) -> bool {
        // SAFETY: the handle is owned by this entry
        unsafe { WaitForSingleObject(self.raw(), 0) != WAIT_TIMEOUT }
    }
}

/// Process handles of running children, keyed by pid
#[derive(Default)]
struct ProcessTable {
    entries: Mutex<HashMap<u32, Arc<ProcessEntry>>>,
}

impl fmt::Debug for ProcessTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTable")
            .field("running", &self.entries.lock().len())
            .finish()
    }
}

impl ProcessTable {
    fn insert(&self, pid: u32, handle: OwnedHandle, input: Arc<File>) {
        self.entries
            .lock()
            .insert(pid, Arc::new(ProcessEntry { handle, input }));
    }

    fn get(&self, pid: u32) -> Option<Arc<ProcessEntry>> {
        self.entries.lock().get(&pid).cloned()
    }

    fn wait(&self, pid: u32) -> Result<ExitStatus> {
        let entry = self
            .get(pid)
            .ok_or_else(|| Error::Wait(io::ErrorKind::NotFound.into()))?;

        // SAFETY: the entry keeps the handle open for the duration of the wait
        if unsafe { WaitForSingleObject(entry.raw(), INFINITE) } == WAIT_FAILED {
            return Err(Error::Wait(io::Error::last_os_error()));
        }
        let mut code: u32 = 0;
        // SAFETY: as above; code outlives the call
        let ok = unsafe { GetExitCodeProcess(entry.raw(), &mut code) };
        self.entries.lock().remove(&pid);
        if ok == 0 {
            return Err(Error::Wait(io::Error::last_os_error()));
        }
        Ok(ExitStatus::Exited(code as i32))
    }

    fn raise(&self, pid: u32, signal: SignalKind) -> Result<bool> {
        let Some(entry) = self.get(pid) else {
            return Ok(false);
        };
        if entry.has_exited() {
            return Ok(false);
        }

        match signal {
            SignalKind::Liveness => Ok(true),
            // Geometry already went through ResizePseudoConsole
            SignalKind::WindowChange => Ok(true),
            SignalKind::Interrupt => {
                (&*entry.input)
                    .write_all(&[CTRL_C])
                    .map_err(Error::Signal)?;
                Ok(true)
            }
            SignalKind::Hangup | SignalKind::Terminate | SignalKind::Kill => {
                // SAFETY: the entry keeps the handle open
                if unsafe { TerminateProcess(entry.raw(), TERMINATED_EXIT_CODE) } == 0 {
                    if entry.has_exited() {
                        return Ok(false);
                    }
                    return Err(Error::Signal(io::Error::last_os_error()));
                }
                Ok(true)
            }
        }
    }
}

/// Handles streams are opened from; dropped on release
struct Ends {
    input: Arc<File>,
    output: Arc<File>,
    pipe: Option<Arc<NamedPipe>>,
}

/// A pseudo console, named pipe, or anonymous pipe pair
pub struct WinDevice {
    kind: ChannelKind,
    slave_name: String,
    console: bool,
    ends: Mutex<Option<Ends>>,
    /// Still reachable through open streams after release
    pipe: Weak<NamedPipe>,
    hpcon: Mutex<Option<HPCON>>,
    child_ends: Mutex<Option<(OwnedHandle, OwnedHandle)>>,
    size: Mutex<WindowSize>,
    broken: Arc<AtomicBool>,
}

impl fmt::Debug for WinDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinDevice")
            .field("kind", &self.kind)
            .field("slave_name", &self.slave_name)
            .field("console", &self.console)
            .field("released", &self.ends.lock().is_none())
            .finish()
    }
}

/// Server end of the auxiliary pipe, connected on first use
struct NamedPipe {
    name: Vec<u16>,
    server: Arc<File>,
    connected: AtomicBool,
    woken: AtomicBool,
    /// Serializes connect attempts; never taken by `wake`
    connect: Mutex<()>,
}

impl NamedPipe {
    fn new(name: Vec<u16>, server: Arc<File>) -> Self {
        Self {
            name,
            server,
            connected: AtomicBool::new(false),
            woken: AtomicBool::new(false),
            connect: Mutex::new(()),
        }
    }

    /// Block until the child opened the pipe
    fn ensure_connected(&self) -> io::Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let _connect = self.connect.lock();
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.woken.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe broken before the child connected",
            ));
        }
        // SAFETY: synchronous connect on our own server handle
        let ok = unsafe { ConnectNamedPipe(self.server.as_raw_handle() as HANDLE, ptr::null_mut()) };
        if ok == 0 {
            let err = io::Error::last_os_error();
            // ERROR_NO_DATA: a client came and went before we got here
            let code = err.raw_os_error();
            if code != Some(ERROR_PIPE_CONNECTED as i32) && code != Some(ERROR_NO_DATA as i32) {
                return Err(err);
            }
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Release a connect nobody will answer by connecting to ourselves
    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        if self.connected.load(Ordering::Acquire) {
            return;
        }
        // SAFETY: name is NUL-terminated
        let handle = unsafe {
            CreateFileW(
                self.name.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null(),
                OPEN_EXISTING,
                0,
                0,
            )
        };
        if handle != INVALID_HANDLE_VALUE {
            // SAFETY: fresh handle, dropped immediately
            drop(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) });
        }
    }
}

impl WinDevice {
    fn pseudo_console(kind: ChannelKind, size: WindowSize) -> Result<Self> {
        let (child_in, input) = anonymous_pipe(false).map_err(Error::Allocation)?;
        let (output, child_out) = anonymous_pipe(false).map_err(Error::Allocation)?;

        let mut hpcon: HPCON = 0;
        // SAFETY: both pipe ends are live; conhost duplicates them
        let hr = unsafe {
            CreatePseudoConsole(
                coord(size),
                child_in.as_raw_handle() as HANDLE,
                child_out.as_raw_handle() as HANDLE,
                0,
                &mut hpcon,
            )
        };
        if hr != S_OK {
            return Err(Error::Allocation(io::Error::from_raw_os_error(hr)));
        }
        // conhost holds its own copies now
        drop(child_in);
        drop(child_out);

        let slave_name = format!("conpty:{:x}", hpcon);
        debug!(slave = %slave_name, ?kind, "created pseudo console");
        Ok(Self::assemble(kind, slave_name, true, input, output, size)
            .with_pseudo_console(hpcon))
    }

    fn named_pipe(kind: ChannelKind, size: WindowSize) -> Result<Self> {
        let name = format!(
            r"\\.\pipe\mochi-ptyproc-{}-{}",
            std::process::id(),
            PIPE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let wide_name = wide(OsStr::new(&name));
        // SAFETY: wide_name is NUL-terminated
        let handle = unsafe {
            CreateNamedPipeW(
                wide_name.as_ptr(),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_FIRST_PIPE_INSTANCE,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                PIPE_BUFFER,
                PIPE_BUFFER,
                0,
                ptr::null(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::Allocation(io::Error::last_os_error()));
        }
        // SAFETY: CreateNamedPipeW returned a fresh handle
        let file = Arc::new(unsafe { File::from_raw_handle(handle as RawHandle) });
        debug!(slave = %name, ?kind, "created named pipe");

        let pipe = Arc::new(NamedPipe::new(wide_name, Arc::clone(&file)));
        let mut device = Self::assemble(kind, name, false, Arc::clone(&file), file, size);
        device.pipe = Arc::downgrade(&pipe);
        if let Some(ends) = device.ends.get_mut() {
            ends.pipe = Some(pipe);
        }
        Ok(device)
    }

    fn anonymous_pipes(kind: ChannelKind, size: WindowSize) -> Result<Self> {
        let (child_in, input) = anonymous_pipe(true).map_err(Error::Allocation)?;
        let (output, child_out) = anonymous_pipe(true).map_err(Error::Allocation)?;
        for ours in [&input, &output] {
            // SAFETY: our ends must not leak into the child
            unsafe { SetHandleInformation(ours.as_raw_handle() as HANDLE, HANDLE_FLAG_INHERIT, 0) };
        }

        let slave_name = format!(
            "pipe:{:x}:{:x}",
            child_in.as_raw_handle() as usize,
            child_out.as_raw_handle() as usize
        );
        let device = Self::assemble(kind, slave_name, false, input, output, size);
        *device.child_ends.lock() =
            Some((OwnedHandle::from(child_in), OwnedHandle::from(child_out)));
        Ok(device)
    }

    fn assemble(
        kind: ChannelKind,
        slave_name: String,
        console: bool,
        input: impl Into<Arc<File>>,
        output: impl Into<Arc<File>>,
        size: WindowSize,
    ) -> Self {
        Self {
            kind,
            slave_name,
            console,
            ends: Mutex::new(Some(Ends {
                input: input.into(),
                output: output.into(),
                pipe: None,
            })),
            pipe: Weak::new(),
            hpcon: Mutex::new(None),
            child_ends: Mutex::new(None),
            size: Mutex::new(size),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    fn with_pseudo_console(self, hpcon: HPCON) -> Self {
        *self.hpcon.lock() = Some(hpcon);
        self
    }

    fn pseudo_console(&self) -> Option<HPCON> {
        *self.hpcon.lock()
    }

    fn child_ends(&self) -> Option<(HANDLE, HANDLE)> {
        self.child_ends.lock().as_ref().map(|(stdin, stdout)| {
            (
                stdin.as_raw_handle() as HANDLE,
                stdout.as_raw_handle() as HANDLE,
            )
        })
    }

    fn release_child_ends(&self) {
        self.child_ends.lock().take();
    }

    fn input_file(&self) -> io::Result<Arc<File>> {
        self.ends
            .lock()
            .as_ref()
            .map(|ends| Arc::clone(&ends.input))
            .ok_or_else(released)
    }

    fn close_pseudo_console(&self) {
        if let Some(hpcon) = self.hpcon.lock().take() {
            // SAFETY: taken out of the slot, so closed exactly once
            unsafe { ClosePseudoConsole(hpcon) };
        }
    }
}

impl Drop for WinDevice {
    fn drop(&mut self) {
        self.close_pseudo_console();
    }
}

impl PtyDevice for WinDevice {
    fn slave_name(&self) -> &str {
        &self.slave_name
    }

    fn is_console(&self) -> bool {
        self.console
    }

    fn open_reader(&self) -> io::Result<Box<dyn MasterRead>> {
        let ends = self.ends.lock();
        let ends = ends.as_ref().ok_or_else(released)?;
        Ok(Box::new(WinReader {
            device_output: Arc::clone(&ends.output),
            broken: Arc::clone(&self.broken),
            closed: AtomicBool::new(false),
            pipe: ends.pipe.clone(),
        }))
    }

    fn open_writer(&self) -> io::Result<Box<dyn MasterWrite>> {
        let ends = self.ends.lock();
        let ends = ends.as_ref().ok_or_else(released)?;
        Ok(Box::new(WinWriter {
            file: Arc::clone(&ends.input),
            closed: AtomicBool::new(false),
            pipe: ends.pipe.clone(),
        }))
    }

    fn window_size(&self) -> Result<WindowSize> {
        Ok(*self.size.lock())
    }

    fn set_window_size(&self, size: WindowSize) -> Result<()> {
        if let Some(hpcon) = self.pseudo_console() {
            // SAFETY: the pseudo console stays open while it is in the slot
            let hr = unsafe { ResizePseudoConsole(hpcon, coord(size)) };
            if hr != S_OK {
                return Err(Error::WindowSize(io::Error::from_raw_os_error(hr)));
            }
        }
        *self.size.lock() = size;
        Ok(())
    }

    fn break_read(&self) {
        trace!(slave = %self.slave_name, "breaking reads");
        self.broken.store(true, Ordering::Release);
        // conhost flushes and closes its output pipe, ending pending reads
        self.close_pseudo_console();
        // The aux pipe ends on its own when the child's end closes
        if let Some(pipe) = self.pipe.upgrade() {
            pipe.wake();
        }
    }

    fn release(&self) {
        // The pseudo console stays: closing it ends the child
        if self.ends.lock().take().is_some() {
            self.release_child_ends();
            debug!(slave = %self.slave_name, "released device");
        }
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device released")
}

struct WinReader {
    device_output: Arc<File>,
    broken: Arc<AtomicBool>,
    closed: AtomicBool,
    pipe: Option<Arc<NamedPipe>>,
}

impl MasterRead for WinReader {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        if let Some(pipe) = &self.pipe {
            if let Err(e) = pipe.ensure_connected() {
                if self.closed.load(Ordering::Acquire) || self.broken.load(Ordering::Acquire) {
                    return Ok(0);
                }
                return Err(e);
            }
        }
        match BrokenPipeAsEof::new(&*self.device_output).read(buf) {
            Ok(n) => Ok(n),
            Err(_) if self.closed.load(Ordering::Acquire) || self.broken.load(Ordering::Acquire) => {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // SAFETY: cancels only I/O on our own handle
        unsafe { CancelIoEx(self.device_output.as_raw_handle() as HANDLE, ptr::null()) };
    }
}

struct WinWriter {
    file: Arc<File>,
    closed: AtomicBool,
    pipe: Option<Arc<NamedPipe>>,
}

impl MasterWrite for WinWriter {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        if let Some(pipe) = &self.pipe {
            pipe.ensure_connected()?;
        }
        (&*self.file).write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        (&*self.file).flush()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Create an anonymous pipe; returns (read end, write end)
fn anonymous_pipe(inheritable: bool) -> io::Result<(File, File)> {
    let attributes = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: inheritable as i32,
    };
    let mut read: HANDLE = 0;
    let mut write: HANDLE = 0;
    // SAFETY: both out-pointers are live locals
    if unsafe { CreatePipe(&mut read, &mut write, &attributes, 0) } == 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: CreatePipe handed us both handles
    Ok(unsafe {
        (
            File::from_raw_handle(read as RawHandle),
            File::from_raw_handle(write as RawHandle),
        )
    })
}

fn coord(size: WindowSize) -> COORD {
    COORD {
        X: size.cols.min(i16::MAX as u16) as i16,
        Y: size.rows.min(i16::MAX as u16) as i16,
    }
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0)).collect()
}

/// Join arguments using the MSVC runtime's quoting rules
fn command_line(argv: &[String]) -> String {
    let mut line = String::new();
    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        quote_arg(arg, &mut line);
    }
    line
}

fn quote_arg(arg: &str, out: &mut String) {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| matches!(c, ' ' | '\t' | '\n' | '\x0b' | '"'));
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

/// `KEY=VALUE\0...\0\0` in UTF-16
fn environment_block(env: &BTreeMap<String, String>) -> Vec<u16> {
    let mut block = Vec::new();
    for (key, value) in env {
        block.extend(OsStr::new(&format!("{}={}", key, value)).encode_wide());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}
