//! This module describes the kernel side of GSM 07.10 multiplexing.
//!
//! It holds the `MultiplexerConfig` record exchanged with the n_gsm line
//! discipline, the ioctl request codes used to read and write it, the AT
//! command that switches the modem into CMUX mode and the close-down frame
//! sent on the control channel during teardown.
//!
//! See section 6 of <https://www.kernel.org/doc/Documentation/serial/n_gsm.txt>.

use std::{mem, os::raw::c_int};

use crate::config::MuxTimers;

/// Line discipline number of n_gsm.
pub const N_GSM0710: c_int = 21;

// mips, powerpc and sparc use a 3 bit direction field at bit 29
#[cfg(any(
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc",
    target_arch = "sparc64"
))]
mod ioc_layout {
    pub const DIRSHIFT: u32 = 29;
    pub const WRITE: u32 = 4;
    pub const READ: u32 = 2;
}

#[cfg(not(any(
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc",
    target_arch = "sparc64"
)))]
mod ioc_layout {
    pub const DIRSHIFT: u32 = 30;
    pub const WRITE: u32 = 1;
    pub const READ: u32 = 2;
}

use ioc_layout::{DIRSHIFT as IOC_DIRSHIFT, READ as IOC_READ, WRITE as IOC_WRITE};

/// `_IOC(dir, type, nr, size)` from `<asm-generic/ioctl.h>`.
const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

/// `_IOR('G', 0, struct gsm_config)`
pub const GSMIOC_GETCONF: u32 =
    ioc(IOC_READ, b'G', 0, mem::size_of::<MultiplexerConfig>());

/// `_IOW('G', 1, struct gsm_config)`
pub const GSMIOC_SETCONF: u32 =
    ioc(IOC_WRITE, b'G', 1, mem::size_of::<MultiplexerConfig>());

/// Basic option encapsulation.
pub const ENCAPSULATION_BASIC: u32 = 0;

/// Mirror of the kernel `struct gsm_config` from `<linux/gsmmux.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerConfig {
    pub adaption: u32,
    pub encapsulation: u32,
    pub initiator: u32,
    pub t1: u32,
    pub t2: u32,
    pub t3: u32,
    pub n2: u32,
    pub mru: u32,
    pub mtu: u32,
    pub k: u32,
    pub i: u32,
    pub unused: [u32; 8],
}

impl MultiplexerConfig {
    /// Applies the daemon's multiplexer settings on top of the values read
    /// back from the kernel. Fields not listed here keep the kernel's value.
    ///
    /// `mtu` must be the value advertised in the `AT+CMUX` command, it is used
    /// for both directions.
    pub fn apply(&mut self, mtu: u32, timers: &MuxTimers) {
        self.initiator = 1;
        self.encapsulation = ENCAPSULATION_BASIC;
        self.mru = mtu;
        self.mtu = mtu;
        self.t1 = timers.t1;
        self.n2 = timers.n2;
        self.t2 = timers.t2;
        self.t3 = timers.t3;
    }
}

/// Builds the command asking the modem for basic mode multiplexing with
/// frames of at most `mtu` bytes.
pub fn cmux_command(mtu: u32) -> String {
    format!("AT+CMUX=0,0,,{}\r\n", mtu)
}

const FLAG: u8 = 0xf9;

/// Frame check sequence over the address, control and length octets.
///
/// Reflected CRC-8 with polynomial x^8 + x^2 + x + 1, as in 3GPP TS 27.010.
pub const fn fcs(header: &[u8]) -> u8 {
    let mut crc: u8 = 0xff;
    let mut idx = 0;
    while idx < header.len() {
        crc ^= header[idx];
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xe0 } else { crc >> 1 };
            bit += 1;
        }
        idx += 1;
    }
    0xff - crc
}

const CLOSE_DOWN_HEADER: [u8; 3] = [
    0x03, // channel 0, C/R set, EA
    0xef, // UIH
    0x05, // 2 data bytes, EA
];

/// Multiplexer close-down (CLD) command on the control channel.
pub const GSM0710_TERMINATE: [u8; 8] = [
    FLAG,
    CLOSE_DOWN_HEADER[0],
    CLOSE_DOWN_HEADER[1],
    CLOSE_DOWN_HEADER[2],
    0xc3, // CLD type
    0x01, // zero length
    fcs(&CLOSE_DOWN_HEADER),
    FLAG,
];
