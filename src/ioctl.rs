//! Retry policy shared by every device control request
//!
//! A blocking ioctl interrupted by a signal is simply reissued. Every other
//! failure is surfaced to the caller untouched.

use std::io;

use nix::errno::Errno;
use tracing::trace;

/// Issue a raw ioctl, reissuing it while it fails with `EINTR`.
pub fn retry<T>(mut request: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match request() {
            Err(Errno::EINTR) => trace!("ioctl interrupted by signal, retrying"),
            result => return result,
        }
    }
}

/// Same policy for calls that already report through `io::Error`.
pub fn retry_io<T>(mut request: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match request() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                trace!("request interrupted by signal, retrying")
            }
            result => return result,
        }
    }
}
