//! Process primitive and child bootstrap (spec components C6 and C7).
//!
//! Child creation is a real `fork(2)` (grounded on `wormhole/src/rpc.rs`'s
//! use of `nix::unistd::fork`), not fork+exec: the child keeps running the
//! caller's `target` closure rather than a different executable.
//!
//! `spawn` requires the calling runtime to be `current_thread`: a
//! multi-worker runtime cannot be forked safely (its other worker threads
//! simply vanish in the child, mid-whatever-they-were-doing). But even with
//! one OS thread, the child must not keep driving the *inherited* reactor
//! in place: tokio's I/O driver owns one epoll instance for the whole
//! runtime, and `fork()` duplicates that fd into the child rather than
//! giving it a private copy. If the child polled it concurrently with the
//! parent, the two processes would race over the same edge-triggered
//! wakeups — whichever calls `epoll_wait` first can consume a readiness
//! event the other was waiting for, which is exactly the kind of
//! fork-after-epoll hazard gevent's hub reinitializes itself to avoid on
//! every `fork()`. Rust's equivalent of "build a fresh hub" is a fresh
//! runtime, and that can't be built on the thread that just forked either
//! — tokio refuses to enter a runtime while one is already entered on the
//! thread, a flag `fork()` carries into the child along with the rest of
//! the thread's memory. So the child spawns a brand-new OS thread, which
//! starts with empty thread-locals and owns no epoll fd yet, and builds its
//! own `current_thread` runtime there to drive `target()`.

use crate::error::Result;

/// Anything that owns one or two registry-tracked fds and can be handed to
/// a child process. Implemented for [`crate::endpoint::ReadEndpoint`],
/// [`crate::endpoint::WriteEndpoint`] and
/// [`crate::endpoint::DuplexEndpoint`]. Rust has no equivalent of scanning
/// `args`/`kwargs` for pipe objects by duck type, so the caller states the
/// transferred endpoints explicitly instead.
pub trait Transferable: Send + Sync {
    fn identities(&self) -> Vec<String>;
    fn close_in_parent(&self) -> Result<()>;
}

#[cfg(unix)]
mod unix_impl {
    use std::collections::HashMap;
    use std::future::Future;
    use std::os::fd::RawFd;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{fork, ForkResult, Pid};
    use once_cell::sync::Lazy;
    use tokio::runtime::RuntimeFlavor;
    use tokio::sync::{Notify, OnceCell};
    use tracing::{debug, trace, warn};

    use super::Transferable;
    use crate::error::{Error, Result};
    use crate::io::{self as pipeio, PipeFile};
    use crate::registry;

    struct ProcessEntry {
        exit_code: StdMutex<Option<i32>>,
        notify: Notify,
    }

    static TABLE: Lazy<StdMutex<HashMap<i32, Arc<ProcessEntry>>>> =
        Lazy::new(|| StdMutex::new(HashMap::new()));

    /// Keyed by pid rather than a bare `OnceCell<()>` so a forked child —
    /// which inherits this in the already-initialized state along with the
    /// rest of the process's memory, but whose copy of the reaper task died
    /// with the parent's runtime — re-installs its own watcher the first
    /// time it calls `spawn` itself, instead of seeing "already started"
    /// and silently never reaping its own children (spec.md §4.6 step 6).
    static REAPER: Lazy<StdMutex<(u32, Arc<OnceCell<()>>)>> =
        Lazy::new(|| StdMutex::new((0, Arc::new(OnceCell::const_new()))));

    /// Raw fd the SIGCHLD handler writes a wakeup byte to. `-1` means no
    /// pipe is installed yet. A plain `AtomicI32` rather than anything
    /// lock-based: the handler runs on a signal stack and must touch
    /// nothing that could block or allocate.
    static SIGCHLD_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

    /// The self-pipe's (read, write) fds currently owned by this process.
    /// `fork()` duplicates this static into the child still pointing at
    /// the *parent's* pipe; [`install_sigchld_pipe`] replaces it with a
    /// private pair the first time the child installs its own reaper, the
    /// same way libev recreates its signal pipe on `ev_loop_fork()` rather
    /// than keep sharing the pre-fork one (gipc's `_child` triggers this
    /// via `gevent.reinit()`).
    static SIGCHLD_PIPE: Lazy<StdMutex<Option<(RawFd, RawFd)>>> = Lazy::new(|| StdMutex::new(None));

    extern "C" fn sigchld_action(_signum: libc::c_int) {
        let fd = SIGCHLD_WRITE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = 0u8;
            unsafe {
                libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            }
        }
    }

    /// Gives this process a self-pipe nobody else in the fork tree can
    /// drain, and points a real `sigaction` at it. Unlike
    /// `signal-hook-registry` (used by `tokio::signal`), there is no
    /// process-global "already registered" bookkeeping to fight here: this
    /// is plain `nix::sys::signal::sigaction`, called directly, every time
    /// a process needs its own reaper. Returns the read end to watch.
    fn install_sigchld_pipe() -> RawFd {
        let (read_fd, write_fd) = nix::unistd::pipe()
            .map(|(r, w)| (std::os::fd::IntoRawFd::into_raw_fd(r), std::os::fd::IntoRawFd::into_raw_fd(w)))
            .expect("failed to create SIGCHLD self-pipe");
        pipeio::set_nonblocking(read_fd).expect("failed to set self-pipe read end non-blocking");
        pipeio::set_nonblocking(write_fd).expect("failed to set self-pipe write end non-blocking");

        let previous = SIGCHLD_PIPE.lock().unwrap().replace((read_fd, write_fd));
        if let Some((old_read, old_write)) = previous {
            pipeio::close_raw(old_read);
            pipeio::close_raw(old_write);
        }
        SIGCHLD_WRITE_FD.store(write_fd, Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(sigchld_action),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe {
            signal::sigaction(Signal::SIGCHLD, &action).expect("failed to install SIGCHLD handler");
        }

        read_fd
    }

    /// Installs the SIGCHLD-driven reaper exactly once per process. Must
    /// run before the first child can reach zombie state, so `spawn`
    /// awaits this before forking. `tokio::spawn` only queues the task; it
    /// does not run until the caller yields, so this waits on a readiness
    /// handshake rather than just the spawn call returning — otherwise a
    /// child that exits before the reaper task gets its first poll would
    /// never be reaped.
    async fn ensure_reaper_started() {
        let pid = std::process::id();
        let cell = {
            let mut guard = REAPER.lock().unwrap();
            if guard.0 != pid {
                *guard = (pid, Arc::new(OnceCell::const_new()));
            }
            guard.1.clone()
        };
        cell.get_or_init(|| async {
            let read_fd = install_sigchld_pipe();
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(reaper_loop(read_fd, ready_tx));
            let _ = ready_rx.await;
        })
        .await;
    }

    async fn reaper_loop(read_fd: RawFd, ready: tokio::sync::oneshot::Sender<()>) {
        let file = match PipeFile::from_raw_fd(read_fd) {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to watch SIGCHLD self-pipe: {e}");
                let _ = ready.send(());
                return;
            }
        };
        let _ = ready.send(());
        let mut buf = [0u8; 128];
        loop {
            match file.read_nb(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => reap_available(),
            }
        }
    }

    /// Drains every zombie child currently waitable, without blocking.
    /// This is the "libev-style child watcher" of spec.md §4.6 step 6,
    /// driven by tokio's signal stream instead of a libev loop; it is the
    /// only reaper in the process — there is no ambient reaper to
    /// neutralise, since tokio never installs one for `fork()`-only
    /// (non-`exec`) children.
    fn reap_available() {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => record_exit(pid, code),
                Ok(WaitStatus::Signaled(pid, sig, _core_dumped)) => {
                    record_exit(pid, -(sig as i32))
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_other) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }

    fn record_exit(pid: Pid, code: i32) {
        let entry = TABLE.lock().unwrap().remove(&pid.as_raw());
        if let Some(entry) = entry {
            *entry.exit_code.lock().unwrap() = Some(code);
            entry.notify.notify_waiters();
            trace!(pid = pid.as_raw(), code, "reaped child");
        }
    }

    static NEXT_NAME: AtomicI32 = AtomicI32::new(0);

    /// A handle to an OS child process created by [`spawn`].
    pub struct Process {
        pid: Pid,
        parent_pid: u32,
        entry: Arc<ProcessEntry>,
        daemon: bool,
        name: String,
    }

    impl Process {
        pub fn pid(&self) -> i32 {
            self.pid.as_raw()
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        pub fn daemon(&self) -> bool {
            self.daemon
        }

        /// `Some(code)` once the child has exited: a non-negative value is
        /// the child's exit status, a negative value is `-signal_number`
        /// for the signal that killed it.
        pub fn exitcode(&self) -> Option<i32> {
            *self.entry.exit_code.lock().unwrap()
        }

        pub fn is_alive(&self) -> bool {
            self.exitcode().is_none()
        }

        /// Cooperative join: suspends the calling task, not the OS thread,
        /// until the child exits or `timeout` elapses. On timeout, returns
        /// without error; the caller is expected to probe
        /// [`Process::is_alive`].
        pub async fn join(&self, timeout: Option<Duration>) -> Result<()> {
            if std::process::id() != self.parent_pid {
                return Err(Error::misuse(
                    "join() called from a process other than the one that started the child",
                ));
            }
            loop {
                if self.exitcode().is_some() {
                    return Ok(());
                }
                let notified = self.entry.notify.notified();
                if self.exitcode().is_some() {
                    return Ok(());
                }
                match timeout {
                    None => notified.await,
                    Some(d) => {
                        if tokio::time::timeout(d, notified).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }

        pub fn terminate(&self) -> Result<()> {
            signal::kill(self.pid, Signal::SIGTERM).map_err(|e| Error::Io(e.into()))
        }
    }

    /// Resets every inherited handler to its default disposition, matching
    /// `gipc._child`'s rationale for not leaving the parent's handler
    /// state lying around for the child's own code to trip over. SIGCHLD
    /// resets cleanly too: unlike `signal-hook-registry`, which only calls
    /// `sigaction` the first time a signal is ever registered in a
    /// process's lineage, [`install_sigchld_pipe`] calls `sigaction`
    /// itself, unconditionally, the moment this process next needs a
    /// reaper — so resetting it here first costs nothing.
    fn reset_signal_dispositions() {
        for sig in Signal::iterator() {
            if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP | Signal::SIGPIPE) {
                continue;
            }
            unsafe {
                let _ = signal::signal(sig, SigHandler::SigDfl);
            }
        }
    }

    /// Drops the parent's table of in-flight children: none of those pids
    /// are this child's to reap (they belong to the original parent, not
    /// to whatever forks from here), and leaving stale entries behind
    /// risks misattributing a reaped exit if the child later forks a
    /// grandchild that happens to reuse one of those pid numbers.
    /// `ensure_reaper_started` re-installs its own watcher the next time
    /// this child calls `spawn`, since [`REAPER`] is keyed by pid.
    fn reset_reaper_state() {
        TABLE.lock().unwrap().clear();
    }

    /// Spawns a child process running `target` to completion, then
    /// exiting with the `i32` it returns.
    ///
    /// `transfer` lists the endpoints the child is allowed to keep; every
    /// other endpoint registered in this process is closed in the child
    /// before `target` runs, and the listed endpoints are closed in the
    /// parent once the child has them (spec.md invariants P6/P7).
    /// `target` must itself own (typically via `.clone()`) the endpoints
    /// it needs, since it runs only in the child.
    pub async fn spawn<F, Fut>(
        transfer: &[&dyn Transferable],
        daemon: bool,
        name: Option<String>,
        target: F,
    ) -> std::io::Result<Process>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = i32> + 'static,
    {
        if tokio::runtime::Handle::current().runtime_flavor() != RuntimeFlavor::CurrentThread {
            return Err(std::io::Error::other(
                "spawn() requires a current_thread tokio runtime; forking a multi-worker \
                 runtime would abandon its other OS threads mid-task in the child",
            ));
        }

        ensure_reaper_started().await;

        let keep: Vec<String> = transfer.iter().flat_map(|t| t.identities()).collect();
        let parent_pid = std::process::id();

        // SAFETY: single-threaded cooperative runtime, no other OS thread
        // can be holding a lock this process doesn't know about at fork
        // time.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let entry = Arc::new(ProcessEntry {
                    exit_code: StdMutex::new(None),
                    notify: Notify::new(),
                });
                TABLE.lock().unwrap().insert(child.as_raw(), entry.clone());

                for t in transfer {
                    if let Err(e) = t.close_in_parent() {
                        warn!("failed to close transferred endpoint in parent: {e}");
                    }
                }

                let name = name.unwrap_or_else(|| {
                    format!("process-{}", NEXT_NAME.fetch_add(1, Ordering::Relaxed))
                });
                debug!(pid = child.as_raw(), %name, "spawned child");

                Ok(Process {
                    pid: child,
                    parent_pid,
                    entry,
                    daemon,
                    name,
                })
            }
            Ok(ForkResult::Child) => {
                reset_signal_dispositions();
                registry::restamp_all(std::process::id());
                registry::prune_to(&keep);
                reset_reaper_state();

                // The thread that just forked carries the parent's epoll
                // fd and tokio's "runtime already entered" marker in its
                // memory; a fresh thread has neither, so it's where the
                // child builds its own runtime and drives `target` on it.
                // Every surviving endpoint's `AsyncFd` was registered
                // against the parent's driver before the fork, so it has
                // to be re-registered against this new runtime's driver
                // before `target` touches it.
                let code = std::thread::spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build child runtime");
                    rt.block_on(async {
                        registry::rebind_surviving();
                        target().await
                    })
                })
                .join()
                .unwrap_or(101);
                std::process::exit(code);
            }
            Err(e) => Err(std::io::Error::from(e)),
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{spawn, Process};

/// Windows has no `fork()`: a faithful port spawns a fresh process image
/// via `CreateProcess` and re-enters a registered entrypoint, duplicating
/// transferred HANDLEs as inheritable (spec.md §4.6 steps 3/4, §9
/// "Process-boundary handle transfer"). That path needs a Windows
/// toolchain to validate end to end, which this build does not have
/// available; rather than ship unverified unsafe FFI, `spawn` here reports
/// the build as unsupported. See DESIGN.md for the Open Question this
/// resolves.
#[cfg(windows)]
mod windows_impl {
    use std::future::Future;
    use std::time::Duration;

    use crate::error::{Error, Result};

    use super::Transferable;

    pub struct Process {
        _private: (),
    }

    impl Process {
        pub fn pid(&self) -> i32 {
            0
        }

        pub fn name(&self) -> &str {
            ""
        }

        pub fn daemon(&self) -> bool {
            false
        }

        pub fn exitcode(&self) -> Option<i32> {
            None
        }

        pub fn is_alive(&self) -> bool {
            false
        }

        pub async fn join(&self, _timeout: Option<Duration>) -> Result<()> {
            Err(Error::misuse("process join unsupported on this build"))
        }

        pub fn terminate(&self) -> Result<()> {
            Err(Error::misuse("process terminate unsupported on this build"))
        }
    }

    pub async fn spawn<F, Fut>(
        _transfer: &[&dyn Transferable],
        _daemon: bool,
        _name: Option<String>,
        _target: F,
    ) -> std::io::Result<Process>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = i32> + 'static,
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Windows child-process spawning is not implemented in this build; see DESIGN.md",
        ))
    }
}

#[cfg(windows)]
pub use windows_impl::{spawn, Process};
