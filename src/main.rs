mod config;
mod error;
mod modem_ctl;
mod signals;

use std::{env, path::PathBuf};

use config::CmuxConfig;
use env_logger::Env;
use error::Result;
use log::{error, info};
use modem_ctl::{
    mux_channel::ChannelHdl, response_loop::CmuxResponse,
    serial_link::TtyPort, CmuxController, ModemCtl,
};
use signals::TerminationSignals;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    info!("Starting modem cmux");

    let config = CmuxConfig::load(env::args_os().nth(1).map(PathBuf::from))?;

    //open the serial port connected to the modem---------
    let port = TtyPort::open(
        &config.serial_port,
        config.baud_rate,
        config.response_timeout(),
    )?;

    let channel = ChannelHdl::from_path(&config.mux_channel_port);

    let mut controller =
        CmuxController::new(port, channel, CmuxResponse, &config);

    controller.bring_up()?;

    // keep the line discipline attached until we are told to stop
    let result = match TerminationSignals::install() {
        Ok(mut signals) => {
            info!("CMUX ready, waiting for a termination signal");
            signals.wait().await;
            Ok(())
        }
        Err(e) => {
            error!("Cannot install signal handlers, error: {}", e);
            Err(e)
        }
    };

    controller.shutdown();

    info!("cmux daemon exit");

    result
}
