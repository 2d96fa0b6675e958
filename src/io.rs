//! Non-blocking I/O shim (spec component C1).
//!
//! Wraps one pipe file descriptor in a [`tokio::io::unix::AsyncFd`], the
//! same shape as `wormhole::asyncfile::AsyncFile`, but exposing the two
//! primitive operations the rest of the crate needs directly (`read_nb`,
//! `write_nb`) instead of `AsyncRead`/`AsyncWrite`, since callers must be
//! able to observe short reads/writes rather than have them looped away.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;

/// Reads never request more than this from the kernel in one syscall, even
/// if the caller wants more: larger single reads have been observed to
/// degrade syscall latency on Linux and to trip a kernel read bug on macOS.
pub(crate) const MAX_READ_CHUNK: usize = 64 * 1024;

pub(crate) fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl(borrowed, FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(borrowed, FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

/// A bare `close(2)`, bypassing any `AsyncFd`/driver involvement. See
/// [`PipeFile::into_raw_fd`] for why that matters during child bootstrap.
pub(crate) fn close_raw(fd: RawFd) {
    let owned = unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) };
    let _ = nix::unistd::close(owned);
}

pub(crate) struct PipeFile {
    inner: AsyncFd<std::fs::File>,
}

impl PipeFile {
    /// Takes ownership of `fd`: it must not be closed by anyone else.
    pub(crate) fn from_raw_fd(fd: RawFd) -> std::io::Result<Self> {
        set_nonblocking(fd)?;
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }

    /// One non-blocking `read(2)`, capped at [`MAX_READ_CHUNK`], suspending
    /// the caller until the fd is readable if the kernel buffer is empty.
    pub(crate) async fn read_nb(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let cap = buf.len().min(MAX_READ_CHUNK);
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(&mut buf[..cap])) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// One non-blocking `write(2)`, suspending the caller until the kernel
    /// buffer has room if it is currently full.
    pub(crate) async fn write_nb(&self, buf: &[u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Raw fd this wraps, for handing to a fresh [`PipeFile`] registered
    /// under a different runtime. `AsyncFd::into_inner` itself deregisters
    /// from the driver this was registered against before handing back the
    /// fd, which is exactly what a post-fork rebind needs: the old
    /// driver's epoll instance is never polled again once the child moves
    /// to a fresh runtime, so there is nothing left for that deregister
    /// call to race with.
    pub(crate) fn into_raw_fd(self) -> RawFd {
        self.inner.into_inner().into_raw_fd()
    }

    /// Raw fd this wraps, closing it with a plain [`close_raw`] without
    /// ever asking this `AsyncFd` to deregister. Unlike [`into_raw_fd`],
    /// this is for an fd whose complementary end is still in active use
    /// elsewhere (the owning process being pruned away during child
    /// bootstrap, while the other end stays open in the parent): both
    /// `AsyncFd::drop` and `AsyncFd::into_inner` call `epoll_ctl(DEL)`
    /// against the driver this was registered with, and across a `fork()`
    /// that driver's epoll instance is a kernel object shared with the
    /// parent — a `DEL` issued from the child for a fd the parent still
    /// depends on silently cancels the parent's own readiness
    /// registration for the same underlying pipe end. `mem::forget`ing the
    /// `AsyncFd` skips both teardown paths; the plain `close(2)` afterward
    /// still releases the descriptor.
    pub(crate) fn close_without_deregister(self) {
        let fd = self.inner.get_ref().as_raw_fd();
        std::mem::forget(self.inner);
        close_raw(fd);
    }

    /// Parks until the fd is readable without consuming any bytes. Used to
    /// let a caller-supplied timeout govern only the wait for the first
    /// byte of a frame, not the rest of the read.
    pub(crate) async fn wait_readable(&self) -> std::io::Result<()> {
        let _ = self.inner.readable().await?;
        Ok(())
    }
}

/// Loops `write_nb` until the whole buffer is on the wire. A single frame
/// may span arbitrarily many `write_nb` calls when the payload exceeds the
/// kernel pipe buffer.
pub(crate) async fn write_all_nb(file: &PipeFile, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = file.write_nb(buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write returned 0 bytes",
            ));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Loops `read_nb` until `buf` is completely filled or EOF is observed.
/// Returns the number of bytes actually read before EOF, so the caller can
/// distinguish a clean EOF (zero bytes, start of frame) from a truncated
/// frame (some bytes, EOF mid-frame).
pub(crate) async fn read_exact_nb(file: &PipeFile, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_nb(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(filled);
        }
        filled += n;
    }
    Ok(filled)
}
