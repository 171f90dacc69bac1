//! The device pairs belonging to one child process

use tracing::debug;

use crate::config::ProcessConfig;
use crate::error::Result;
use crate::pty::{ChannelKind, PtyBackend, PtyDevice};
use crate::size::WindowSize;

/// Primary device pair plus the optional error and auxiliary pairs.
///
/// Allocated before spawn and owned by the lifecycle layer. Draining the
/// process releases the devices; a device's descriptors close once the
/// streams opened on it are closed as well.
pub struct PtyChannelSet<D> {
    primary: D,
    error: Option<D>,
    auxiliary: Option<D>,
}

impl<D: PtyDevice> PtyChannelSet<D> {
    /// Allocate every device the configuration asks for, each at the initial size
    pub(crate) fn allocate<B>(backend: &B, config: &ProcessConfig) -> Result<Self>
    where
        B: PtyBackend<Device = D>,
    {
        let size = config.initial_size();
        let primary = backend.allocate(ChannelKind::Primary, config.console, size)?;

        let error = if config.console
            && !config.redirect_error_stream
            && backend.supports_error_channel()
        {
            Some(backend.allocate(ChannelKind::Error, config.console, size)?)
        } else {
            None
        };

        let auxiliary = if config.auxiliary_channel {
            Some(backend.allocate(ChannelKind::Auxiliary, config.console, size)?)
        } else {
            None
        };

        debug!(
            primary = primary.slave_name(),
            error = error.as_ref().map(|d| d.slave_name()),
            auxiliary = auxiliary.as_ref().map(|d| d.slave_name()),
            "allocated channels"
        );

        Ok(Self {
            primary,
            error,
            auxiliary,
        })
    }

    pub fn primary(&self) -> &D {
        &self.primary
    }

    pub fn error(&self) -> Option<&D> {
        self.error.as_ref()
    }

    pub fn auxiliary(&self) -> Option<&D> {
        self.auxiliary.as_ref()
    }

    /// stderr has its own readable stream.
    ///
    /// Needs a separate error device and a primary that is a real console;
    /// otherwise stderr shares the primary channel.
    pub fn has_distinct_error(&self) -> bool {
        self.error.is_some() && self.primary.is_console()
    }

    /// All allocated devices, primary first
    pub fn devices(&self) -> impl Iterator<Item = &D> {
        std::iter::once(&self.primary)
            .chain(self.error.as_ref())
            .chain(self.auxiliary.as_ref())
    }

    /// Apply a size to every channel
    pub fn set_window_size(&self, size: WindowSize) -> Result<()> {
        for device in self.devices() {
            device.set_window_size(size)?;
        }
        Ok(())
    }

    /// Current size of the primary channel
    pub fn window_size(&self) -> Result<WindowSize> {
        self.primary.window_size()
    }

    /// Make every pending and future read on every channel end after the queued data
    pub fn break_reads(&self) {
        for device in self.devices() {
            device.break_read();
        }
    }

    /// Let go of every device; descriptors close once the streams on them are closed
    pub fn release(&self) {
        for device in self.devices() {
            device.release();
        }
    }
}
