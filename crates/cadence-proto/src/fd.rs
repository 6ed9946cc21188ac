//! `SCM_RIGHTS` ancillary-data helpers for passing one file descriptor per
//! frame over a `AF_UNIX` stream socket.

use std::io;
use std::os::fd::{OwnedFd, RawFd};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FdPassingError {
    #[error("sendmsg failed: {0}")]
    Send(io::Error),
    #[error("recvmsg failed: {0}")]
    Recv(io::Error),
    #[error("ancillary data truncated")]
    Truncated,
}

/// Send `buf` (must be non-empty) on `sock`, attaching `fd` as `SCM_RIGHTS`.
/// Returns the number of bytes of `buf` actually written (short writes are
/// possible on a non-blocking socket; the caller must retry the remainder
/// as a plain write, since the fd has already ridden along with byte 0).
pub fn send_with_fd(sock: RawFd, buf: &[u8], fd: RawFd) -> Result<usize, FdPassingError> {
    debug_assert!(!buf.is_empty());

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut _,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u8; unsafe { cmsg_space_one_fd() }];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(FdPassingError::Truncated);
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
    }

    let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(FdPassingError::Send(err));
    }
    Ok(n as usize)
}

/// Receive into `buf`, collecting at most one passed fd (re-accepted with
/// `CLOEXEC` set). Returns `(bytes_read, Option<fd>)`; `0` bytes
/// with no fd means EOF or would-block (caller distinguishes via errno
/// already folded into the `io::Result` at the call site).
pub fn recv_with_fd(sock: RawFd, buf: &mut [u8]) -> Result<(usize, Option<OwnedFd>), FdPassingError> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut _,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u8; unsafe { cmsg_space_one_fd() }];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
    msg.msg_controllen = cmsg_buf.len() as _;

    let flags = libc::MSG_CMSG_CLOEXEC;
    let n = unsafe { libc::recvmsg(sock, &mut msg, flags) };
    if n < 0 {
        return Err(FdPassingError::Recv(io::Error::last_os_error()));
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(FdPassingError::Truncated);
    }

    let mut passed: Option<OwnedFd> = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
                // MSG_CMSG_CLOEXEC is Linux-specific but widely supported; set it
                // explicitly too so the fd is never leaked across an exec on any unix.
                let flags = libc::fcntl(raw, libc::F_GETFD);
                if flags >= 0 {
                    libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC);
                }
                passed = Some(std::os::fd::FromRawFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, passed))
}

/// `CMSG_SPACE` for exactly one fd, computed at compile time via a const fn
/// shim since `libc::CMSG_SPACE` itself isn't const.
const unsafe fn cmsg_space_one_fd() -> usize {
    // Mirrors glibc's CMSG_SPACE(len): align(sizeof(cmsghdr) + len, sizeof(size_t))
    let len = std::mem::size_of::<RawFd>();
    let hdr = std::mem::size_of::<libc::cmsghdr>();
    let align = std::mem::size_of::<usize>();
    let raw = hdr + len;
    (raw + align - 1) & !(align - 1)
}
