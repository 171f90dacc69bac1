//! The per-process reaper thread
//!
//! One dedicated thread executes the child and then blocks in the native
//! wait for it. Executing and waiting on the same thread matters on hosts
//! where only the forking thread may reap its children. The thread is the
//! only writer of the lifecycle state.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tracing::{debug, debug_span, warn};

use crate::channel::PtyChannelSet;
use crate::config::ProcessConfig;
use crate::error::{Error, Result};
use crate::process::Shared;
use crate::pty::{PtyBackend, PtyDevice, SpawnRequest};
use crate::signal::ExitStatus;

/// Owned copy of everything the execute primitive needs
pub(crate) struct SpawnPlan {
    pub(crate) program: String,
    pub(crate) argv: Vec<String>,
    envp: BTreeMap<String, String>,
    directory: PathBuf,
    console: bool,
}

impl SpawnPlan {
    /// Resolve the command line (auxiliary placeholder included) and environment
    pub(crate) fn new<D: PtyDevice>(config: &ProcessConfig, channels: &PtyChannelSet<D>) -> Self {
        let argv = config.command_line(channels.auxiliary().map(|d| d.slave_name()));
        Self {
            program: argv.first().cloned().unwrap_or_default(),
            argv,
            envp: config.resolved_environment(),
            directory: config.working_directory().to_path_buf(),
            console: config.console,
        }
    }
}

/// Start the reaper thread for `shared`
pub(crate) fn launch<B: PtyBackend>(shared: Arc<Shared<B>>, plan: SpawnPlan) -> Result<()> {
    let name = format!("pty reaper {}", plan.program);
    let program = plan.program.clone();
    thread::Builder::new()
        .name(name)
        .spawn(move || run(shared, plan))
        .map(drop)
        .map_err(|e: io::Error| Error::Spawn {
            command: program,
            source: e,
        })
}

fn run<B: PtyBackend>(shared: Arc<Shared<B>>, plan: SpawnPlan) {
    let _span = debug_span!("reaper", program = %plan.program).entered();

    let channels = &shared.channels;
    let request = SpawnRequest {
        program: &plan.program,
        argv: &plan.argv,
        envp: &plan.envp,
        directory: &plan.directory,
        primary: channels.primary(),
        error: if channels.has_distinct_error() {
            channels.error()
        } else {
            None
        },
        auxiliary: channels.auxiliary(),
        console: plan.console,
    };

    let pid = match shared.backend.execute(&request) {
        Ok(pid) => pid,
        Err(e) => {
            warn!(error = %e, "spawn failed");
            shared.publish_spawn(Err(e));
            channels.break_reads();
            return;
        }
    };
    shared.publish_spawn(Ok(pid));

    let status = match shared.backend.wait_for(pid) {
        Ok(status) => status,
        Err(e) => {
            warn!(pid, error = %e, "wait failed, exit status lost");
            ExitStatus::Unknown
        }
    };
    debug!(pid, %status, "child exited");

    shared.publish_exit(status);
    channels.break_reads();
}
