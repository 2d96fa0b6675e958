//! Endpoint (spec component C3): owns one pipe fd (read or write) or two
//! (duplex), carrying identity, owner-pid stamp, per-endpoint lock and
//! closed flag. Framing is a 4-byte big-endian length prefix followed by
//! exactly that many encoded bytes, grounded on `wormhole/src/rpc.rs`'s
//! `read_bytes`/`ServerMessage::write`.

use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::io::{self, PipeFile};
use crate::lock::CoopLock;
use crate::process::Transferable;
use crate::registry::{self, Registered};

static NEXT_IDENTITY: AtomicU32 = AtomicU32::new(1);

fn new_identity() -> String {
    let n = NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed);
    format!("ep-{:x}-{:x}", std::process::id(), n)
}

/// A caller-supplied timeout expired while waiting for the first byte of a
/// frame. Kept separate from [`Error`]: spec.md treats timeouts as a
/// runtime-level concept, not a library error kind, and requires the
/// endpoint to remain fully usable afterwards.
#[derive(Debug, thiserror::Error)]
pub enum GetError {
    #[error("timed out waiting for a frame")]
    Timeout,
    #[error(transparent)]
    Endpoint(#[from] Error),
}

/// State shared by one fd's worth of read or write direction. Registered
/// in the process-wide handle registry under `identity`.
pub(crate) struct Inner {
    identity: String,
    owner_pid: AtomicU32,
    closed: AtomicBool,
    file: StdMutex<Option<Arc<PipeFile>>>,
    frame_lock: CoopLock,
}

impl Inner {
    fn from_raw_fd(fd: RawFd) -> std::io::Result<Arc<Self>> {
        let file = PipeFile::from_raw_fd(fd)?;
        let inner = Arc::new(Self {
            identity: new_identity(),
            owner_pid: AtomicU32::new(std::process::id()),
            closed: AtomicBool::new(false),
            file: StdMutex::new(Some(Arc::new(file))),
            frame_lock: CoopLock::new(),
        });
        registry::insert(inner.clone() as Arc<dyn Registered>);
        Ok(inner)
    }

    fn check_owner_and_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        if self.owner_pid.load(Ordering::Acquire) != std::process::id() {
            return Err(Error::misuse(format!(
                "endpoint {} used from a process that does not own it",
                self.identity
            )));
        }
        Ok(())
    }

    fn current_file(&self) -> Result<Arc<PipeFile>> {
        self.check_owner_and_open()?;
        self.file
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::AlreadyClosed)
    }

    /// Re-registers the underlying fd's `AsyncFd` under whichever runtime
    /// is current on the calling thread. The fd itself is unaffected; only
    /// its driver registration is rebuilt. Called during child bootstrap,
    /// since a registration made before `fork()` is still tied to the
    /// parent's now-unpolled I/O driver.
    fn rebind(&self) {
        let mut slot = self.file.lock().unwrap();
        if let Some(old) = slot.take() {
            let fd = match Arc::try_unwrap(old) {
                Ok(file) => file.into_raw_fd(),
                Err(shared) => {
                    // Another clone of this endpoint still references the
                    // same PipeFile; rebinding in place would leave that
                    // clone holding a stale AsyncFd, but that clone belongs
                    // to the same Inner and will observe the new one on its
                    // next lookup since both share this Mutex.
                    *slot = Some(shared);
                    return;
                }
            };
            match PipeFile::from_raw_fd(fd) {
                Ok(file) => *slot = Some(Arc::new(file)),
                Err(e) => {
                    tracing::warn!("failed to rebind endpoint {} after fork: {e}", self.identity);
                }
            }
        }
    }

    /// Close per spec.md §4.3: already-closed, then misuse, then a
    /// non-blocking lock attempt, then the actual descriptor teardown.
    fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        if self.owner_pid.load(Ordering::Acquire) != std::process::id() {
            return Err(Error::misuse(format!(
                "endpoint {} closed from a process that does not own it",
                self.identity
            )));
        }
        let _guard = self.frame_lock.try_acquire().ok_or(Error::Locked)?;
        *self.file.lock().unwrap() = None;
        self.closed.store(true, Ordering::Release);
        registry::remove(&self.identity);
        Ok(())
    }

    /// Translates `close()`'s result the way a scoped-release exit does:
    /// already-closed is swallowed (legitimate early close), locked is
    /// re-signalled as misuse (a scope may not leave a locked endpoint
    /// behind).
    fn close_scoped(&self) -> Result<()> {
        match self.close() {
            Ok(()) => Ok(()),
            Err(Error::AlreadyClosed) => Ok(()),
            Err(Error::Locked) => Err(Error::misuse(format!(
                "endpoint {} still locked at scope exit",
                self.identity
            ))),
            Err(e) => Err(e),
        }
    }
}

impl Registered for Inner {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn force_unlock(&self) {
        self.frame_lock.force_unlock();
    }

    fn close_for_bootstrap(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.frame_lock.force_unlock();
        if let Some(file) = self.file.lock().unwrap().take() {
            if let Ok(file) = Arc::try_unwrap(file) {
                file.close_without_deregister();
            }
        }
        registry::remove(&self.identity);
    }

    fn owner_pid_store(&self, pid: u32) {
        self.owner_pid.store(pid, Ordering::Release);
    }

    fn rebind(&self) {
        Inner::rebind(self);
    }
}

async fn write_frame(file: &PipeFile, payload: &[u8]) -> Result<()> {
    if payload.len() > i32::MAX as usize {
        return Err(Error::misuse("encoded frame exceeds 2^31-1 bytes"));
    }
    let len = (payload.len() as u32).to_be_bytes();
    io::write_all_nb(file, &len).await?;
    io::write_all_nb(file, payload).await?;
    Ok(())
}

async fn read_frame(file: &PipeFile) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    let n = io::read_exact_nb(file, &mut len_bytes).await?;
    if n == 0 {
        return Err(Error::Eof);
    }
    if n < 4 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "message truncated by EOF while reading length prefix",
        )));
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        let n = io::read_exact_nb(file, &mut payload).await?;
        if n < len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "message truncated by EOF mid-payload",
            )));
        }
    }
    Ok(payload)
}

/// The readable end of one pipe, decoding values of type `T`.
pub struct ReadEndpoint<T> {
    pub(crate) inner: Arc<Inner>,
    decoder: Arc<dyn Decoder<T>>,
    _marker: PhantomData<T>,
}

impl<T> Clone for ReadEndpoint<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            decoder: self.decoder.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> ReadEndpoint<T> {
    pub(crate) fn new(fd: RawFd, decoder: Arc<dyn Decoder<T>>) -> std::io::Result<Self> {
        Ok(Self {
            inner: Inner::from_raw_fd(fd)?,
            decoder,
            _marker: PhantomData,
        })
    }

    /// Reads and decodes the next whole frame. If `timeout` is given, it
    /// bounds only the wait for the first byte of the frame; once that
    /// byte arrives the read runs to completion regardless of the
    /// timeout, since cancelling mid-frame would desynchronise the
    /// stream.
    pub async fn get(&self, timeout: Option<Duration>) -> std::result::Result<T, GetError> {
        self.inner.check_owner_and_open()?;
        let _guard = self.inner.frame_lock.acquire().await;
        let file = self.inner.current_file()?;

        if let Some(timeout) = timeout {
            match tokio::time::timeout(timeout, file.wait_readable()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(GetError::Endpoint(Error::Io(e))),
                Err(_elapsed) => return Err(GetError::Timeout),
            }
        }

        let payload = read_frame(&file).await?;
        let value = self.decoder.decode(&payload)?;
        Ok(value)
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn close_scoped(&self) -> Result<()> {
        self.inner.close_scoped()
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }
}

/// The writable end of one pipe, encoding values of type `T`.
pub struct WriteEndpoint<T> {
    pub(crate) inner: Arc<Inner>,
    encoder: Arc<dyn Encoder<T>>,
    _marker: PhantomData<T>,
}

impl<T> Clone for WriteEndpoint<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            encoder: self.encoder.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> WriteEndpoint<T> {
    pub(crate) fn new(fd: RawFd, encoder: Arc<dyn Encoder<T>>) -> std::io::Result<Self> {
        Ok(Self {
            inner: Inner::from_raw_fd(fd)?,
            encoder,
            _marker: PhantomData,
        })
    }

    /// Encodes `value` and writes a whole frame, looping over as many
    /// `write_nb` calls as the payload requires.
    pub async fn put(&self, value: &T) -> Result<()> {
        self.inner.check_owner_and_open()?;
        let _guard = self.inner.frame_lock.acquire().await;
        let file = self.inner.current_file()?;
        let payload = self.encoder.encode(value)?;
        write_frame(&file, &payload).await
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn close_scoped(&self) -> Result<()> {
        self.inner.close_scoped()
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }
}

/// Both directions of one logical channel, backed by two distinct
/// underlying pipes (forward and reverse).
pub struct DuplexEndpoint<T> {
    pub(crate) read: ReadEndpoint<T>,
    pub(crate) write: WriteEndpoint<T>,
}

impl<T> Clone for DuplexEndpoint<T> {
    fn clone(&self) -> Self {
        Self {
            read: self.read.clone(),
            write: self.write.clone(),
        }
    }
}

impl<T: Send + 'static> DuplexEndpoint<T> {
    pub(crate) fn new(read: ReadEndpoint<T>, write: WriteEndpoint<T>) -> Self {
        Self { read, write }
    }

    pub async fn get(&self, timeout: Option<Duration>) -> std::result::Result<T, GetError> {
        self.read.get(timeout).await
    }

    pub async fn put(&self, value: &T) -> Result<()> {
        self.write.put(value).await
    }

    /// Closes the write half first, then the read half: on Windows,
    /// closing the read side of a duplex pipe before the write side is
    /// drained can deadlock.
    pub fn close(&self) -> Result<()> {
        match self.write.inner.close() {
            Ok(()) => self.read.inner.close(),
            Err(Error::AlreadyClosed) => self.read.inner.close(),
            Err(e) => Err(e),
        }
    }

    pub fn close_scoped(&self) -> Result<()> {
        let write_err = self.write.inner.close_scoped().err();
        let read_err = self.read.inner.close_scoped().err();
        if let Some(e) = write_err {
            return Err(e);
        }
        if let Some(e) = read_err {
            return Err(e);
        }
        Ok(())
    }
}

/// Closes a pair of scoped endpoints in the order spec.md §4.5 requires:
/// the second element first, the first element second, always attempting
/// both even if the first attempt fails.
pub fn close_pair_scoped(
    first: &impl ScopedClose,
    second: &impl ScopedClose,
) -> Result<()> {
    let second_err = second.close_scoped().err();
    let first_err = first.close_scoped().err();
    if let Some(e) = second_err {
        return Err(e);
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    Ok(())
}

pub trait ScopedClose {
    fn close_scoped(&self) -> Result<()>;
}

impl<T> ScopedClose for ReadEndpoint<T> {
    fn close_scoped(&self) -> Result<()> {
        self.inner.close_scoped()
    }
}

impl<T> ScopedClose for WriteEndpoint<T> {
    fn close_scoped(&self) -> Result<()> {
        self.inner.close_scoped()
    }
}

impl<T: Send + 'static> ScopedClose for DuplexEndpoint<T> {
    fn close_scoped(&self) -> Result<()> {
        DuplexEndpoint::close_scoped(self)
    }
}

impl<T: Send + Sync> Transferable for ReadEndpoint<T> {
    fn identities(&self) -> Vec<String> {
        vec![self.inner.identity.clone()]
    }

    fn close_in_parent(&self) -> Result<()> {
        self.inner.close()
    }
}

impl<T: Send + Sync> Transferable for WriteEndpoint<T> {
    fn identities(&self) -> Vec<String> {
        vec![self.inner.identity.clone()]
    }

    fn close_in_parent(&self) -> Result<()> {
        self.inner.close()
    }
}

impl<T: Send + Sync + 'static> Transferable for DuplexEndpoint<T> {
    fn identities(&self) -> Vec<String> {
        vec![self.read.inner.identity.clone(), self.write.inner.identity.clone()]
    }

    fn close_in_parent(&self) -> Result<()> {
        self.close()
    }
}
