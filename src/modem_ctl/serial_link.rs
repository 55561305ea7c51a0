//! This module provides access to the serial line wired to the modem.
//!
//! The `SerialLink` trait is the seam used by the bring-up controller and the
//! response loop; `TtyPort` implements it on top of a `serialport` tty opened
//! raw 8N1 with hardware flow control. Only the blocking-mode toggle, the
//! readiness wait and the n_gsm ioctls go to the descriptor directly.

use std::{
    io::{self, Read, Write},
    os::{
        raw::c_int,
        unix::io::{AsRawFd, IntoRawFd, RawFd},
    },
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use log::{debug, error, info};
use serialport::{DataBits, FlowControl, Parity, StopBits, TTYPort};

use super::gsm_mux::{MultiplexerConfig, GSMIOC_GETCONF, GSMIOC_SETCONF};
use crate::error::Result;

#[cfg(test)]
use mockall::automock;

/// Operations on the serial line used during CMUX bring-up and teardown.
#[cfg_attr(test, automock)]
pub trait SerialLink {
    /// Writes `data` once and returns the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Reads whatever is available into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Switches non-blocking mode and returns whether it was enabled before.
    fn set_nonblocking(&mut self, enabled: bool) -> io::Result<bool>;

    /// Waits until the line is readable.
    ///
    /// Returns `Ok(false)` if `timeout` elapsed without data.
    fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Attaches the line discipline `ldisc` to the line.
    fn set_line_discipline(&mut self, ldisc: c_int) -> io::Result<()>;

    /// Reads the multiplexer configuration of the n_gsm discipline.
    fn mux_config(&mut self) -> io::Result<MultiplexerConfig>;

    /// Writes the multiplexer configuration of the n_gsm discipline.
    fn set_mux_config(&mut self, config: &MultiplexerConfig) -> io::Result<()>;

    /// Releases the device. Later calls are no-ops.
    fn close(&mut self) -> io::Result<()>;

    fn get_path(&self) -> &Path;
}

fn cvt(rc: c_int) -> io::Result<c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// A tty device configured for talking to the modem.
///
/// The descriptor is owned by the struct and closed exactly once, either by
/// `close` or when the port is dropped.
pub struct TtyPort {
    path: PathBuf,
    port: Option<TTYPort>,
}

impl TtyPort {
    /// Opens `path` in raw 8N1 mode with hardware flow control at `baud`.
    ///
    /// `serialport` opens the device non-blocking so a missing carrier cannot
    /// hang the open, then switches it back to blocking mode. Reads and
    /// writes give up after `io_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened or configured,
    /// including a baud rate the driver refuses. Nothing stays open on error.
    pub fn open(path: &Path, baud: u32, io_timeout: Duration) -> Result<Self> {
        info!("Opening serial port {:?}", path);

        let port = serialport::new(path.to_string_lossy(), baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Hardware)
            .timeout(io_timeout)
            .open_native()
            .map_err(|e| {
                error!("Cannot open {:?}: {}", path, e);
                e
            })
            .with_context(|| format!("Cannot open {:?}", path))?;

        debug!("{:?} configured at {} baud", path, baud);

        Ok(Self::from_port(path, port))
    }

    /// Wraps a tty that is already open and configured.
    pub fn from_port(path: &Path, port: TTYPort) -> Self {
        Self { path: path.to_path_buf(), port: Some(port) }
    }

    fn raw_fd(&self) -> io::Result<RawFd> {
        self.port.as_ref().map(|p| p.as_raw_fd()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "serial port closed")
        })
    }

    fn port(&mut self) -> io::Result<&mut TTYPort> {
        self.port.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "serial port closed")
        })
    }
}

impl SerialLink for TtyPort {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.port()?.write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port()?.read(buf)
    }

    fn set_nonblocking(&mut self, enabled: bool) -> io::Result<bool> {
        let fd = self.raw_fd()?;
        let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;
        let was_enabled = flags & libc::O_NONBLOCK != 0;

        let flags = if enabled {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;

        Ok(was_enabled)
    }

    fn poll_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut fds =
            libc::pollfd { fd: self.raw_fd()?, events: libc::POLLIN, revents: 0 };
        let timeout_ms =
            c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);

        // hang-ups and errors count as readable, the following read reports them
        let ready = cvt(unsafe { libc::poll(&mut fds, 1, timeout_ms) })?;
        Ok(ready > 0)
    }

    fn set_line_discipline(&mut self, ldisc: c_int) -> io::Result<()> {
        let fd = self.raw_fd()?;
        cvt(unsafe { libc::ioctl(fd, libc::TIOCSETD, &ldisc as *const c_int) })?;
        Ok(())
    }

    fn mux_config(&mut self) -> io::Result<MultiplexerConfig> {
        let fd = self.raw_fd()?;
        let mut config = MultiplexerConfig::default();
        cvt(unsafe {
            libc::ioctl(fd, GSMIOC_GETCONF as _, &mut config as *mut MultiplexerConfig)
        })?;
        Ok(config)
    }

    fn set_mux_config(&mut self, config: &MultiplexerConfig) -> io::Result<()> {
        let fd = self.raw_fd()?;
        cvt(unsafe {
            libc::ioctl(fd, GSMIOC_SETCONF as _, config as *const MultiplexerConfig)
        })?;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        match self.port.take() {
            Some(port) => {
                debug!("Closing {:?}", self.path);
                let fd = port.into_raw_fd();
                cvt(unsafe { libc::close(fd) })?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn get_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TtyPort {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close {:?}, error: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs::File, thread};

    use crate::modem_ctl::response_loop::{CmuxResponse, ResponseLoop};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn pty_port() -> (TTYPort, TtyPort) {
        let (master, slave) = TTYPort::pair().unwrap();
        let port = TtyPort::from_port(Path::new("/dev/pts/modem"), slave);
        (master, port)
    }

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_open_missing_device_fails() {
        init_logger();
        let result = TtyPort::open(
            Path::new("/dev/does-not-exist-cmux"),
            115200,
            Duration::from_millis(100),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_open_non_tty_fails() {
        init_logger();
        // /dev/null opens fine but is not a terminal
        let result = TtyPort::open(
            Path::new("/dev/null"),
            115200,
            Duration::from_millis(100),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_close_then_drop_closes_once() {
        init_logger();
        let (_master, mut port) = pty_port();
        let fd = port.raw_fd().unwrap();
        assert!(fd_is_open(fd));

        port.close().unwrap();
        assert!(port.close().is_ok());
        assert_eq!(
            port.write(b"AT\r\n").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );

        // the freed number is handed out again, dropping the port must not
        // close it a second time
        let reused = File::open("/dev/null").unwrap();
        drop(port);
        assert!(fd_is_open(reused.as_raw_fd()));
    }

    #[test]
    fn test_nonblocking_toggle_reports_previous_mode() {
        init_logger();
        let (_master, mut port) = pty_port();

        let before = port.set_nonblocking(true).unwrap();
        assert!(port.set_nonblocking(before).unwrap());
        assert_eq!(port.set_nonblocking(before).unwrap(), before);
    }

    #[test]
    fn test_poll_times_out_without_data() {
        init_logger();
        let (_master, mut port) = pty_port();

        assert!(!port.poll_readable(Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn test_handshake_over_pty() {
        init_logger();
        let (mut master, mut port) = pty_port();

        let modem = thread::spawn(move || {
            master.write_all(b"OK\r\n").unwrap();
            master
        });

        let response_loop = ResponseLoop::new(64, Duration::from_secs(2));
        let result = response_loop.run(&mut port, &CmuxResponse);
        let _master = modem.join().unwrap();

        assert!(result.is_ok());
    }
}
