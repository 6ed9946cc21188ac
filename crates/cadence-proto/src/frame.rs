use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::creds::peer_credentials;
use crate::fd::{recv_with_fd, send_with_fd};
use crate::{MessageType, ProtocolError, MAX_PAYLOAD};

/// `type(1) + pid(4) + uid(4) + has_fd(1) + len(4)`.
pub const HEADER_LEN: usize = 1 + 4 + 4 + 1 + 4;

const READ_CHUNK: usize = 64 * 1024;

/// One fully decoded frame, ready for dispatch.
#[derive(Debug)]
pub struct Frame {
    pub kind: MessageType,
    pub pid: u32,
    pub uid: u32,
    pub fd: Option<OwnedFd>,
    pub payload: Vec<u8>,
}

/// Result of draining the output buffer toward the socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct Progress {
    pub written: usize,
    pub would_block: bool,
    pub closed: bool,
}

/// A framed, non-blocking duplex connection over a unix stream socket.
///
/// Owns its own input and output buffers so a command handler can
/// `compose` replies without blocking, leaving the event loop to drain
/// them once the fd reports writable.
pub struct Connection {
    stream: UnixStream,
    out: VecDeque<u8>,
    out_fds: VecDeque<(u64, OwnedFd)>,
    out_sent: u64,
    out_enqueued: u64,
    in_buf: VecDeque<u8>,
    in_fds: VecDeque<OwnedFd>,
    in_consumed: u64,
    peer_pid: u32,
    peer_uid: u32,
    eof: bool,
}

impl Connection {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let (peer_pid, peer_uid) = peer_credentials(stream.as_raw_fd());
        Ok(Self {
            stream,
            out: VecDeque::new(),
            out_fds: VecDeque::new(),
            out_sent: 0,
            out_enqueued: 0,
            in_buf: VecDeque::new(),
            in_fds: VecDeque::new(),
            in_consumed: 0,
            peer_pid,
            peer_uid,
            eof: false,
        })
    }

    /// Whether the peer has closed its end (EOF seen on the last read).
    /// The event loop should close this connection once `read_one` has
    /// drained any remaining buffered frames.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer_pid(&self) -> u32 {
        self.peer_pid
    }

    pub fn peer_uid(&self) -> u32 {
        self.peer_uid
    }

    /// Whether `compose` has buffered bytes `flush` hasn't yet pushed to
    /// the socket. The event loop uses this to decide whether a fd needs
    /// writable interest, rather than requesting it unconditionally.
    pub fn has_pending_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Enqueue a frame on the output buffer. Does not touch the socket;
    /// call [`Connection::flush`] from the event loop once writable.
    pub fn compose(&mut self, kind: MessageType, pid: u32, fd: Option<RawFd>, payload: &[u8]) {
        if let Some(fd) = fd {
            self.out_fds.push_back((self.out_enqueued, dup_as_owned(fd)));
        }

        self.out.push_back(kind as u8);
        self.out.extend(pid.to_ne_bytes());
        self.out.extend(0u32.to_ne_bytes());
        self.out.push_back(fd.is_some() as u8);
        let len = payload.len() as u32;
        self.out.extend(len.to_ne_bytes());
        self.out.extend(payload.iter().copied());

        self.out_enqueued += (HEADER_LEN + payload.len()) as u64;
    }

    /// Drain as much of the output buffer as the socket accepts right now.
    pub fn flush(&mut self) -> Progress {
        let mut progress = Progress::default();

        loop {
            if self.out.is_empty() {
                break;
            }

            if let Some(&(offset, _)) = self.out_fds.front() {
                if offset == self.out_sent {
                    let byte = [self.out.front().copied().unwrap()];
                    let fd = self.out_fds.front().unwrap().1.as_raw_fd();
                    match send_with_fd(self.as_raw_fd(), &byte, fd) {
                        Ok(0) => {
                            progress.would_block = true;
                            break;
                        }
                        Ok(_) => {
                            self.out.pop_front();
                            self.out_fds.pop_front();
                            self.out_sent += 1;
                            progress.written += 1;
                            continue;
                        }
                        Err(_) => {
                            progress.closed = true;
                            break;
                        }
                    }
                }
            }

            let limit = self
                .out_fds
                .front()
                .map(|&(offset, _)| (offset - self.out_sent) as usize)
                .unwrap_or(self.out.len())
                .min(self.out.len());
            if limit == 0 {
                break;
            }

            let (first, _) = self.out.as_slices();
            let chunk_len = first.len().min(limit);
            let chunk: Vec<u8> = if chunk_len > 0 {
                first[..chunk_len].to_vec()
            } else {
                self.out.iter().take(limit).copied().collect()
            };

            match write_raw(self.as_raw_fd(), &chunk) {
                Ok(0) => {
                    progress.would_block = true;
                    break;
                }
                Ok(n) => {
                    for _ in 0..n {
                        self.out.pop_front();
                    }
                    self.out_sent += n as u64;
                    progress.written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    progress.would_block = true;
                    break;
                }
                Err(_) => {
                    progress.closed = true;
                    break;
                }
            }
        }

        progress
    }

    /// Pull bytes off the socket into the input buffer without blocking.
    /// Returns `Ok(true)` if the peer closed (EOF).
    fn fill_from_socket(&mut self) -> Result<bool, ProtocolError> {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            match recv_with_fd(self.as_raw_fd(), &mut scratch) {
                Ok((0, None)) => {
                    self.eof = true;
                    return Ok(true);
                }
                Ok((n, fd)) => {
                    self.in_buf.extend(&scratch[..n]);
                    if let Some(fd) = fd {
                        self.in_fds.push_back(fd);
                    }
                    if n < scratch.len() {
                        // Drained the socket for now.
                        return Ok(false);
                    }
                }
                Err(crate::FdPassingError::Recv(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(false);
                }
                Err(e) => return Err(ProtocolError::Fd(e)),
            }
        }
    }

    /// Non-destructively pull one complete frame, if one is buffered.
    pub fn read_one(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let closed = self.fill_from_socket()?;

        if self.in_buf.len() < HEADER_LEN {
            return if closed && !self.in_buf.is_empty() {
                Err(ProtocolError::BadPayload("connection closed mid-header"))
            } else {
                Ok(None)
            };
        }

        let header: Vec<u8> = self.in_buf.iter().take(HEADER_LEN).copied().collect();
        let kind = MessageType::from_u8(header[0])?;
        let has_fd = header[9] != 0;
        let len = u32::from_ne_bytes(header[10..14].try_into().unwrap());

        if len > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLong(len));
        }

        let total = HEADER_LEN + len as usize;
        if self.in_buf.len() < total {
            return if closed {
                Err(ProtocolError::BadPayload("connection closed mid-frame"))
            } else {
                Ok(None)
            };
        }

        for _ in 0..HEADER_LEN {
            self.in_buf.pop_front();
        }
        let payload: Vec<u8> = self.in_buf.drain(..len as usize).collect();
        self.in_consumed += total as u64;

        let fd = if has_fd { self.in_fds.pop_front() } else { None };

        // Trust the kernel-captured peer credentials, not whatever the
        // sender wrote into the header fields.
        Ok(Some(Frame { kind, pid: self.peer_pid, uid: self.peer_uid, fd, payload }))
    }

    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

fn write_raw(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(n as usize)
}

fn dup_as_owned(fd: RawFd) -> OwnedFd {
    let dup = unsafe { libc::dup(fd) };
    unsafe { std::os::fd::FromRawFd::from_raw_fd(dup) }
}
