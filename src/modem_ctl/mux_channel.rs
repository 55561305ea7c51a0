//! This module provides access to one logical channel of the multiplexed link.
//!
//! Once the n_gsm discipline is active the kernel exposes every DLC as a
//! `/dev/gsmttyN` device. The daemon only needs the AT command channel, and
//! only during teardown, to send a final command to the modem.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use log::{debug, error, info};

use crate::error::Result;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait ChannelHdlOps {
    fn open(&mut self) -> Result<()>;

    /// Writes `data` in a single call.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not open, the write fails or the
    /// channel accepts only part of `data`.
    fn write_data(&mut self, data: &[u8]) -> Result<()>;

    /// Releases the channel device. Does nothing if it is not open.
    fn close(&mut self);

    fn get_path(&self) -> &Path;
}

/// Handler of a `gsmtty` channel device.
pub struct ChannelHdl {
    path: PathBuf,
    file: Option<File>,
}

impl ChannelHdl {
    /// Creates a handler for the channel device at `path`. Nothing is opened
    /// until `open` is called.
    pub fn from_path(path: &Path) -> Self {
        Self { path: path.to_path_buf(), file: None }
    }

    fn get_file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            error!("Channel not opened: {:?}", self.path);
            anyhow!("Channel not opened")
        })
    }
}

impl ChannelHdlOps for ChannelHdl {
    fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            info!("Channel already opened: {:?}", self.path);
            return Ok(());
        }

        debug!("Opening channel: {:?}", self.path);
        self.file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
                .open(&self.path)?,
        );

        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let file = self.get_file()?;

        let written = file.write(data).map_err(|e| {
            error!("Failed to write to channel: {:?}, error: {}", path, e);
            e
        })?;

        if written != data.len() {
            return Err(anyhow!(
                "Short write on {:?}: {} of {} bytes",
                path,
                written,
                data.len()
            ));
        }

        Ok(())
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("Channel closed: {:?}", self.path);
        }
    }

    fn get_path(&self) -> &Path {
        &self.path
    }
}
