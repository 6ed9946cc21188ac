//! Opening a playlist entry for handoff to the player worker.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

/// Open `path` read-only with `O_CLOEXEC` set. The returned fd is handed
/// to the player via `Play`; main closes its own copy immediately after
/// (file descriptors transit ownership precisely at the moment they
/// cross a framed message boundary).
pub fn open_track(path: &str) -> io::Result<OwnedFd> {
    let c_path = CString::new(path).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
