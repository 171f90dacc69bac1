//! Process configuration
//!
//! A `ProcessConfig` is immutable once handed to [`PtyProcess::start`];
//! everything it names is validated before any device is allocated.
//!
//! [`PtyProcess::start`]: crate::PtyProcess::start

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::size::WindowSize;

/// Command argument replaced by the auxiliary channel's slave identifier
pub const AUX_PLACEHOLDER: &str = "_DBG_PTY_";

/// Configuration for a child process attached to a PTY
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Executable path followed by its arguments
    pub command: Vec<String>,
    /// Full environment for the child; `None` inherits ours at start time
    pub environment: Option<HashMap<String, String>>,
    /// Working directory; `None` means "."
    pub directory: Option<PathBuf>,
    /// Merge stderr into the primary channel even in console mode
    pub redirect_error_stream: bool,
    /// Initial column count
    pub initial_columns: Option<u16>,
    /// Initial row count
    pub initial_rows: Option<u16>,
    /// Allocate a second, independent PTY for a control/debug stream
    pub auxiliary_channel: bool,
    /// Full-console mode: echo off, stderr on its own channel
    pub console: bool,
    /// Use the legacy pty-emulation backend (Windows only)
    pub legacy_emulation: bool,
}

impl ProcessConfig {
    /// Create a configuration for the given command line
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(e.to_string()))
    }

    /// Set an environment variable, starting from the inherited environment
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.environment
            .get_or_insert_with(|| std::env::vars().collect())
            .insert(key.into(), value.into());
        self
    }

    /// Replace the whole environment
    pub fn environment(mut self, env: HashMap<String, String>) -> Self {
        self.environment = Some(env);
        self
    }

    /// Start from an empty environment
    pub fn env_clear(mut self) -> Self {
        self.environment = Some(HashMap::new());
        self
    }

    /// Set the working directory
    pub fn directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.directory = Some(dir.into());
        self
    }

    /// Set the initial window size
    pub fn size(mut self, size: WindowSize) -> Self {
        self.initial_columns = Some(size.cols);
        self.initial_rows = Some(size.rows);
        self
    }

    pub fn redirect_error_stream(mut self, redirect: bool) -> Self {
        self.redirect_error_stream = redirect;
        self
    }

    pub fn auxiliary_channel(mut self, enabled: bool) -> Self {
        self.auxiliary_channel = enabled;
        self
    }

    pub fn console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn legacy_emulation(mut self, legacy: bool) -> Self {
        self.legacy_emulation = legacy;
        self
    }

    /// Executable path (first command element)
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    /// Working directory, defaulting to "."
    pub fn working_directory(&self) -> &Path {
        self.directory.as_deref().unwrap_or_else(|| Path::new("."))
    }

    /// Initial size, if either dimension was configured
    pub fn initial_size(&self) -> Option<WindowSize> {
        WindowSize::from_parts(self.initial_columns, self.initial_rows)
    }

    /// The environment the child will see, in a stable order
    pub fn resolved_environment(&self) -> BTreeMap<String, String> {
        match &self.environment {
            Some(env) => env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => std::env::vars().collect(),
        }
    }

    /// Command line with every [`AUX_PLACEHOLDER`] replaced by the auxiliary slave
    pub fn command_line(&self, aux_slave: Option<&str>) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| match aux_slave {
                Some(slave) if arg == AUX_PLACEHOLDER => slave.to_string(),
                _ => arg.clone(),
            })
            .collect()
    }

    /// Check everything that can be checked without touching a device
    pub fn validate(&self) -> Result<()> {
        let program = match self.program() {
            Some(p) if !p.is_empty() => p,
            Some(_) => return Err(Error::config("executable path is empty")),
            None => return Err(Error::config("command is empty")),
        };

        if let Some(arg) = self.command.iter().find(|a| a.contains('\0')) {
            return Err(Error::config(format!(
                "argument {:?} of {} contains a NUL byte",
                arg, program
            )));
        }

        if let Some(env) = &self.environment {
            for (key, value) in env {
                if key.is_empty() || key.contains('=') || key.contains('\0') {
                    return Err(Error::config(format!(
                        "invalid environment variable name {:?}",
                        key
                    )));
                }
                if value.contains('\0') {
                    return Err(Error::config(format!(
                        "environment variable {} contains a NUL byte",
                        key
                    )));
                }
            }
        }

        let dir = self.working_directory();
        if dir.as_os_str().is_empty() {
            return Err(Error::config("working directory is empty"));
        }
        if dir.to_string_lossy().contains('\0') {
            return Err(Error::config("working directory contains a NUL byte"));
        }
        match std::fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::config(format!(
                "working directory {} is not a directory",
                dir.display()
            ))),
            Err(e) => Err(Error::config(format!(
                "working directory {}: {}",
                dir.display(),
                e
            ))),
        }
    }
}
