//! This module implements the AT response loop used during the CMUX handshake.
//!
//! Bytes read from the serial line are accumulated in a bounded
//! `ResponseBuffer`, split into lines on `\n` and handed one by one to a
//! `ResponseClassifier`. The loop stops on the first line the classifier
//! considers final, or when the buffer overflows, the modem stays silent, or
//! the line fails.

use std::{
    io,
    ops::{Deref, DerefMut},
    time::Duration,
};

use log::{debug, error, trace};

use super::serial_link::SerialLink;
use crate::error::HandshakeError;

#[cfg(test)]
use mockall::automock;

/// Verdict on a single response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Not a final result, keep reading.
    Continue,
    Success,
    Abort,
}

/// Interprets response lines. Implement it to drive the loop with another
/// modem's vocabulary.
#[cfg_attr(test, automock)]
pub trait ResponseClassifier {
    /// Classifies `line`, stripped of its `\n` and trailing `\r`.
    fn classify(&self, line: &str) -> HandshakeOutcome;
}

/// Final result codes of a plain AT command.
pub struct CmuxResponse;

impl ResponseClassifier for CmuxResponse {
    fn classify(&self, line: &str) -> HandshakeOutcome {
        if line == "OK" {
            return HandshakeOutcome::Success;
        }

        if line.starts_with("ERROR") {
            error!("Modem refused to enter CMUX mode: {}", line);
            return HandshakeOutcome::Abort;
        }

        // echo, URC or an informational response
        HandshakeOutcome::Continue
    }
}

/// Fixed size buffer reassembling response lines from the byte stream.
///
/// One byte of the capacity is always kept free, so at most `capacity - 1`
/// bytes are buffered.
#[derive(Debug)]
pub struct ResponseBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl ResponseBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { data: vec![0; capacity.max(2)].into_boxed_slice(), len: 0 }
    }

    /// Free space available to the next read.
    pub fn spare(&mut self) -> &mut [u8] {
        let end = self.data.len() - 1;
        &mut self.data[self.len..end]
    }

    /// Marks `count` bytes written into `spare()` as valid.
    pub fn commit(&mut self, count: usize) {
        self.len = (self.len + count).min(self.data.len() - 1);
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.data.len() - 1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Removes the first complete line and returns it without its `\n` and
    /// trailing `\r` characters. The remaining bytes move to the front.
    pub fn take_line(&mut self) -> Option<String> {
        let end = self.data[..self.len].iter().position(|&b| b == b'\n')?;

        let mut line = &self.data[..end];
        while let [rest @ .., b'\r'] = line {
            line = rest;
        }
        let line = String::from_utf8_lossy(line).into_owned();

        self.data.copy_within(end + 1..self.len, 0);
        self.len -= end + 1;

        Some(line)
    }
}

/// Keeps a link in non-blocking mode for its lifetime and restores the
/// previous mode when dropped.
pub struct NonBlockingGuard<'a, L: SerialLink + ?Sized> {
    link: &'a mut L,
    previous: bool,
}

impl<'a, L: SerialLink + ?Sized> NonBlockingGuard<'a, L> {
    pub fn new(link: &'a mut L) -> io::Result<Self> {
        let previous = link.set_nonblocking(true)?;
        Ok(Self { link, previous })
    }
}

impl<L: SerialLink + ?Sized> Deref for NonBlockingGuard<'_, L> {
    type Target = L;

    fn deref(&self) -> &L {
        &*self.link
    }
}

impl<L: SerialLink + ?Sized> DerefMut for NonBlockingGuard<'_, L> {
    fn deref_mut(&mut self) -> &mut L {
        &mut *self.link
    }
}

impl<L: SerialLink + ?Sized> Drop for NonBlockingGuard<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.link.set_nonblocking(self.previous) {
            error!(
                "Failed to restore blocking mode on {:?}, error: {}",
                self.link.get_path(),
                e
            );
        }
    }
}

/// Reads and classifies responses until a final result.
#[derive(Debug, Clone)]
pub struct ResponseLoop {
    buffer_size: usize,
    timeout: Duration,
}

impl ResponseLoop {
    /// # Arguments
    ///
    /// * `buffer_size` - Capacity of the response buffer, terminator included.
    /// * `timeout` - Longest wait for the next chunk of data.
    pub fn new(buffer_size: usize, timeout: Duration) -> Self {
        Self { buffer_size, timeout }
    }

    /// Runs the loop on `link`.
    ///
    /// The link is non-blocking while the loop runs and gets its previous mode
    /// back on every exit path. Several responses arriving in one read are
    /// all classified before reading again.
    ///
    /// # Errors
    ///
    /// Returns the reason the handshake stopped without success.
    pub fn run<L, C>(
        &self, link: &mut L, classifier: &C,
    ) -> Result<(), HandshakeError>
    where
        L: SerialLink + ?Sized,
        C: ResponseClassifier + ?Sized,
    {
        let port = link.get_path().display().to_string();
        let mut link = NonBlockingGuard::new(link).map_err(|e| {
            error!("fcntl {}: {}", port, e);
            HandshakeError::Mode(e)
        })?;
        let mut buffer = ResponseBuffer::new(self.buffer_size);

        loop {
            // a single read can carry more than one response
            if let Some(line) = buffer.take_line() {
                match classifier.classify(&line) {
                    HandshakeOutcome::Success => {
                        debug!("read {}: {:?}", port, line);
                        return Ok(());
                    }
                    HandshakeOutcome::Abort => {
                        return Err(HandshakeError::Refused(line));
                    }
                    HandshakeOutcome::Continue => {
                        trace!("read {}: discarding {:?}", port, line);
                        continue;
                    }
                }
            }

            if buffer.is_full() {
                error!("read {}: Receive buffer overflow", port);
                return Err(HandshakeError::Overflow);
            }

            match link.poll_readable(self.timeout) {
                Ok(true) => {}
                Ok(false) => {
                    error!("poll {}: Modem does not reply", port);
                    return Err(HandshakeError::Timeout(self.timeout));
                }
                Err(e) => {
                    error!("poll {}: {}", port, e);
                    return Err(HandshakeError::Wait(e));
                }
            }

            match link.read(buffer.spare()) {
                Ok(0) => {
                    error!("read {}: line closed", port);
                    return Err(HandshakeError::Closed);
                }
                Ok(count) => buffer.commit(count),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!("read {}: {}", port, e);
                    return Err(HandshakeError::Read(e));
                }
            }
        }
    }
}
