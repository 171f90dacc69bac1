//! Starting a child process
//!
//! Validation and allocation happen on the caller's thread; execution
//! happens on the reaper thread, and `start` returns once the reaper has
//! published either a pid or the spawn error.

use std::sync::Arc;

use tracing::info;

use crate::channel::PtyChannelSet;
use crate::config::ProcessConfig;
use crate::error::{Error, Result};
use crate::process::{PtyProcess, Shared};
use crate::pty::{Backend, PtyBackend};
use crate::reaper::{self, SpawnPlan};

impl PtyProcess {
    /// Start a child on the host's PTY backend.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::io::Read;
    /// use mochi_ptyproc::{ProcessConfig, PtyProcess};
    ///
    /// let process = PtyProcess::start(ProcessConfig::new(["/bin/echo", "hi"]))?;
    /// let mut out = String::new();
    /// (&*process.reader()?).read_to_string(&mut out)?;
    /// println!("{} -> {}", out.trim(), process.wait_for());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn start(config: ProcessConfig) -> Result<Self> {
        let backend = Backend::detect(config.legacy_emulation);
        Self::start_with(config, backend)
    }
}

impl<B: PtyBackend> PtyProcess<B> {
    /// Start a child on an explicit backend
    pub fn start_with(config: ProcessConfig, backend: B) -> Result<Self> {
        config.validate()?;
        if config.auxiliary_channel && !backend.supports_auxiliary() {
            return Err(Error::config(format!(
                "the {} backend cannot allocate an auxiliary channel",
                backend.name()
            )));
        }

        let channels = PtyChannelSet::allocate(&backend, &config)?;
        let plan = SpawnPlan::new(&config, &channels);
        let command = plan.argv.join(" ");
        let shared = Arc::new(Shared::new(backend, channels, command));

        reaper::launch(Arc::clone(&shared), plan)?;
        let pid = shared.wait_started()?;

        info!(
            pid,
            backend = shared.backend.name(),
            command = %shared.command,
            "started child"
        );
        Ok(PtyProcess::new(shared, pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AUX_PLACEHOLDER;
    use crate::pty::mock::{Event, MockBackend};
    use crate::process::ProcessState;
    use std::time::Duration;

    fn spawned_argv(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .find_map(|e| match e {
                Event::Spawn { argv, .. } => Some(argv.clone()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_invalid_config_allocates_nothing() {
        let backend = MockBackend::new();
        let handle = backend.handle();
        let err = PtyProcess::start_with(ProcessConfig::default(), backend).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(handle.events().is_empty());
    }

    #[test]
    fn test_spawn_failure_is_returned() {
        let mut backend = MockBackend::new();
        backend.fail_spawn = true;
        let err = PtyProcess::start_with(ProcessConfig::new(["mock"]), backend).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[test]
    fn test_start_waits_for_slow_spawn() {
        let mut backend = MockBackend::new();
        backend.spawn_delay = Duration::from_millis(50);
        let handle = backend.handle();
        let process = PtyProcess::start_with(ProcessConfig::new(["mock"]), backend).unwrap();
        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.pid() > 0);
        handle.exit(crate::signal::ExitStatus::Exited(0));
    }

    #[test]
    fn test_aux_placeholder_substituted() {
        let backend = MockBackend::new();
        let handle = backend.handle();
        let config = ProcessConfig::new(["bashdb", "--tty", AUX_PLACEHOLDER, "script.sh"])
            .auxiliary_channel(true);
        let process = PtyProcess::start_with(config, backend).unwrap();

        assert_eq!(
            spawned_argv(&handle.events()),
            vec!["bashdb", "--tty", "mock:aux", "script.sh"]
        );
        assert_eq!(process.command(), "bashdb --tty mock:aux script.sh");
        assert!(process.aux_reader().unwrap().is_some());
        assert!(process.aux_writer().unwrap().is_some());
    }

    #[test]
    fn test_placeholder_kept_without_aux() {
        let backend = MockBackend::new();
        let handle = backend.handle();
        let config = ProcessConfig::new(["tool", AUX_PLACEHOLDER]);
        let process = PtyProcess::start_with(config, backend).unwrap();

        assert_eq!(spawned_argv(&handle.events()), vec!["tool", AUX_PLACEHOLDER]);
        assert!(process.aux_reader().unwrap().is_none());
    }

    #[test]
    fn test_aux_requires_backend_support() {
        let mut backend = MockBackend::new();
        backend.auxiliary = false;
        let config = ProcessConfig::new(["mock"]).auxiliary_channel(true);
        let err = PtyProcess::start_with(config, backend).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_error_channel_wired_only_in_console_mode() {
        let backend = MockBackend::new();
        let handle = backend.handle();
        let _process =
            PtyProcess::start_with(ProcessConfig::new(["mock"]).console(true), backend).unwrap();
        assert!(handle
            .events()
            .iter()
            .any(|e| matches!(e, Event::Spawn { error: true, .. })));

        let backend = MockBackend::new();
        let handle = backend.handle();
        let _process = PtyProcess::start_with(ProcessConfig::new(["mock"]), backend).unwrap();
        assert!(handle
            .events()
            .iter()
            .any(|e| matches!(e, Event::Spawn { error: false, .. })));
    }
}
