//! Purpose: Single-message, close-on-read byte channel over a pipe(2) pair.
//! Exports: `channel`, `Sender`, `Receiver`, `ChannelState`.
//! Role: Transport under process futures; both halves survive fork(2).
//! Invariants: State only moves `Open -> MessageSent -> Closed`; at most one frame is ever written.
//! Invariants: The sender closes its write half right after sending; the receiver
//! closes its read half right after the first complete read.
//! Invariants: A writer that vanishes before sending leaves the receiver pending, never failed.
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};

pub(crate) const FRAME_MAGIC: [u8; 4] = *b"TDM1";
pub(crate) const FRAME_HEADER_LEN: usize = 8;
pub(crate) const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Open,
    MessageSent,
    Closed,
}

#[derive(Debug)]
pub struct Sender {
    file: Option<File>,
    state: ChannelState,
}

#[derive(Debug)]
pub struct Receiver {
    file: Option<File>,
    state: ChannelState,
    hung_up: bool,
}

pub fn channel() -> Result<(Sender, Receiver), Error> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::io(io::Error::last_os_error()).with_message("pipe failed"));
    }
    let (read_fd, write_fd) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((
        Sender {
            file: Some(File::from(write_fd)),
            state: ChannelState::Open,
        },
        Receiver {
            file: Some(File::from(read_fd)),
            state: ChannelState::Open,
            hung_up: false,
        },
    ))
}

pub(crate) fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::new(ErrorKind::Usage).with_message("message exceeds frame limit"));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn decode_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<usize, Error> {
    if header[0..4] != FRAME_MAGIC {
        return Err(Error::new(ErrorKind::Corrupt).with_message("bad frame magic"));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[4..8]);
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::new(ErrorKind::Corrupt).with_message("frame length out of range"));
    }
    Ok(len)
}

impl Sender {
    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        if self.state != ChannelState::Open {
            return Err(Error::new(ErrorKind::AlreadyFulfilled).with_message("response already sent"));
        }
        let frame = encode_frame(payload)?;
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("sender lost its pipe"))?;
        self.state = ChannelState::MessageSent;
        file.write_all(&frame)
            .and_then(|()| file.flush())
            .map_err(|err| Error::io(err).with_message("failed to write response"))?;
        drop(file);
        Ok(())
    }

    /// Drops the write half without sending; the peer stays pending.
    pub fn close(&mut self) {
        self.file = None;
        if self.state == ChannelState::Open {
            self.state = ChannelState::Closed;
        }
    }
}

impl Receiver {
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Non-blocking check for a complete-or-arriving frame.
    pub fn peek(&mut self) -> Result<bool, Error> {
        self.poll_readable(Duration::ZERO)
    }

    /// Waits up to `timeout` for data, then reads the whole frame if one arrived.
    pub fn try_recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        if !self.poll_readable(timeout)? {
            return Ok(None);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };

        let mut header = [0u8; FRAME_HEADER_LEN];
        match read_full(file, &mut header) {
            Ok(0) => {
                self.hung_up = true;
                return Ok(None);
            }
            Ok(n) if n < FRAME_HEADER_LEN => {
                self.hung_up = true;
                return Err(Error::new(ErrorKind::Corrupt).with_message("truncated frame header"));
            }
            Ok(_) => {}
            Err(err) => return Err(Error::io(err).with_message("failed to read response")),
        }
        let len = decode_header(&header)?;
        let mut payload = vec![0u8; len];
        let read = read_full(file, &mut payload)
            .map_err(|err| Error::io(err).with_message("failed to read response"))?;
        if read < len {
            self.hung_up = true;
            return Err(Error::new(ErrorKind::Corrupt).with_message("truncated frame payload"));
        }

        self.file = None;
        self.state = ChannelState::Closed;
        Ok(Some(payload))
    }

    fn poll_readable(&mut self, timeout: Duration) -> Result<bool, Error> {
        let Some(file) = self.file.as_ref() else {
            return Ok(false);
        };
        if self.hung_up {
            if !timeout.is_zero() {
                std::thread::sleep(timeout);
            }
            return Ok(false);
        }
        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::io(err).with_message("poll failed"));
            }
            if rc == 0 {
                return Ok(false);
            }
            return Ok(pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0);
        }
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
