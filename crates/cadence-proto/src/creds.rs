//! Peer credential lookup (`SO_PEERCRED`) for tagging frames with the
//! sending process's pid, captured from peer credentials or zero if
//! unavailable.

use std::io;
use std::os::fd::RawFd;

/// `(pid, uid)` of the process on the other end of a unix domain socket.
/// Falls back to `(0, 0)` on platforms or socket kinds where `SO_PEERCRED`
/// isn't available (e.g. a `socketpair` endpoint on some BSDs) — never
/// fatal, since this value is advisory metadata only.
pub fn peer_credentials(fd: RawFd) -> (u32, u32) {
    #[cfg(target_os = "linux")]
    {
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut _,
                &mut len,
            )
        };
        if rc == 0 {
            return (cred.pid as u32, cred.uid);
        }
        let _ = io::Error::last_os_error();
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = fd;
    }
    (0, 0)
}
