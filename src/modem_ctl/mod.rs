//! This module drives the modem from plain AT command mode into GSM 07.10
//! multiplexing on top of the kernel n_gsm line discipline, and back out of
//! it when the daemon stops.

pub mod gsm_mux;
pub mod mux_channel;
pub mod response_loop;
pub mod serial_link;

use anyhow::{anyhow, Context};
use gsm_mux::{cmux_command, GSM0710_TERMINATE, N_GSM0710};
use log::{error, info, warn};
use mux_channel::ChannelHdlOps;
use response_loop::{ResponseClassifier, ResponseLoop};
use serial_link::SerialLink;

use crate::config::{CmuxConfig, MuxTimers};
use crate::error::Result;

/// Trait defining the lifecycle of the multiplexed modem link.
pub trait ModemCtl {
    /// Switches the modem and the serial line into CMUX mode.
    ///
    /// # Errors
    ///
    /// Any failure is final, the handshake is not retried since the modem may
    /// already be half way through the mode switch.
    fn bring_up(&mut self) -> Result<()>;

    /// Best effort shutdown of the multiplexer. Failures are only logged and
    /// the serial line is always released.
    fn shutdown(self);
}

/// Struct representing the CMUX bring-up controller.
pub struct CmuxController<L, C, R>
where
    L: SerialLink,
    C: ChannelHdlOps,
    R: ResponseClassifier,
{
    link: L,
    channel: C,
    classifier: R,
    response_loop: ResponseLoop,
    mtu: u32,
    timers: MuxTimers,
    reset_command: String,
}

impl<L: SerialLink, C: ChannelHdlOps, R: ResponseClassifier>
    CmuxController<L, C, R>
{
    /// Creates a new `CmuxController`.
    ///
    /// # Arguments
    ///
    /// * `link` - Serial line connected to the modem, already configured.
    /// * `channel` - AT command channel of the multiplexed link.
    /// * `classifier` - Interpretation of the modem's answer to `AT+CMUX`.
    /// * `config` - Daemon configuration.
    pub fn new(link: L, channel: C, classifier: R, config: &CmuxConfig) -> Self {
        Self {
            link,
            channel,
            classifier,
            response_loop: ResponseLoop::new(
                config.response_buffer_size,
                config.response_timeout(),
            ),
            mtu: config.mtu,
            timers: config.timers,
            reset_command: config.reset_command.clone(),
        }
    }

    fn send_mode_switch(&mut self) -> Result<()> {
        let command = cmux_command(self.mtu);
        info!("Requesting CMUX mode: {}", command.trim_end());

        let written = self.link.write(command.as_bytes()).map_err(|e| {
            error!("write {:?}: {}", self.link.get_path(), e);
            e
        })?;

        if written != command.len() {
            error!("write {:?}: short write", self.link.get_path());
            return Err(anyhow!(
                "Short write of the CMUX command: {} of {} bytes",
                written,
                command.len()
            ));
        }

        Ok(())
    }

    fn enable_mux_discipline(&mut self) -> Result<()> {
        if let Err(e) = self.link.set_line_discipline(N_GSM0710) {
            error!("ioctl TIOCSETD: {}", e);
            return Err(e).context("ioctl TIOCSETD");
        }

        let mut mux_config = self.link.mux_config().map_err(|e| {
            error!("ioctl GSMIOC_GETCONF: {}", e);
            e
        }).context("ioctl GSMIOC_GETCONF")?;

        // we are the initiator and use basic encapsulation
        mux_config.apply(self.mtu, &self.timers);

        if let Err(e) = self.link.set_mux_config(&mux_config) {
            error!("ioctl GSMIOC_SETCONF: {}", e);
            return Err(e).context("ioctl GSMIOC_SETCONF");
        }

        Ok(())
    }

    fn reset_over_channel(&mut self) {
        if let Err(e) = self.channel.open() {
            warn!(
                "cmux - error opening {:?}: {}",
                self.channel.get_path(),
                e
            );
            return;
        }

        if let Err(e) = self.channel.write_data(self.reset_command.as_bytes()) {
            error!("Failed to terminate gsm multiplexing, error: {}", e);
        }
        self.channel.close();
    }
}

impl<L: SerialLink, C: ChannelHdlOps, R: ResponseClassifier> ModemCtl
    for CmuxController<L, C, R>
{
    fn bring_up(&mut self) -> Result<()> {
        self.send_mode_switch()?;

        self.response_loop
            .run(&mut self.link, &self.classifier)
            .context("AT+CMUX handshake")?;
        info!("Modem switched to CMUX mode");

        self.enable_mux_discipline()?;
        info!(
            "n_gsm line discipline enabled on {:?}, MTU {}",
            self.link.get_path(),
            self.mtu
        );

        Ok(())
    }

    fn shutdown(mut self) {
        info!("Terminating gsm multiplexing");

        self.reset_over_channel();

        // close-down frame on the control channel, on the raw line
        match self.link.write(&GSM0710_TERMINATE) {
            Ok(n) if n == GSM0710_TERMINATE.len() => {}
            Ok(n) => error!(
                "Failed to terminate gsm multiplexing, wrote {} of {} bytes",
                n,
                GSM0710_TERMINATE.len()
            ),
            Err(e) => {
                error!("Failed to terminate gsm multiplexing, error: {}", e)
            }
        }

        if let Err(e) = self.link.close() {
            error!("Failed to close {:?}, error: {}", self.link.get_path(), e);
        }
    }
}
