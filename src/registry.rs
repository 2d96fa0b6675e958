use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

/// Anything the registry can enumerate and force-close during child
/// bootstrap. Implemented by the single-direction endpoint state shared by
/// [`crate::endpoint::ReadEndpoint`] and [`crate::endpoint::WriteEndpoint`];
/// a duplex endpoint registers its two halves separately.
pub(crate) trait Registered: Send + Sync {
    fn identity(&self) -> &str;
    /// Drop the lock unconditionally. Used only during bootstrap: a lock
    /// duplicated across `fork()` may read as held even though no task in
    /// the child will ever release it.
    fn force_unlock(&self);
    /// Close, ignoring an already-closed error (legitimate: user code may
    /// have already closed this endpoint before bootstrap runs).
    fn close_for_bootstrap(&self);
    fn owner_pid_store(&self, pid: u32);
    /// Rebuilds this endpoint's async I/O registration under whatever
    /// runtime is current on the calling thread.
    fn rebind(&self);
}

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<dyn Registered>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn insert(handle: Arc<dyn Registered>) {
    REGISTRY
        .lock()
        .unwrap()
        .insert(handle.identity().to_string(), handle);
}

pub(crate) fn remove(identity: &str) {
    REGISTRY.lock().unwrap().remove(identity);
}

/// All endpoints currently registered in this process.
pub(crate) fn snapshot() -> Vec<Arc<dyn Registered>> {
    REGISTRY.lock().unwrap().values().cloned().collect()
}

/// Windows-only: the registry was not inherited across `CreateProcess`, so
/// the child rebuilds it wholesale from the endpoints it was explicitly
/// handed.
#[cfg(windows)]
pub(crate) fn replace(handles: Vec<Arc<dyn Registered>>) {
    let mut map = REGISTRY.lock().unwrap();
    map.clear();
    for handle in handles {
        map.insert(handle.identity().to_string(), handle);
    }
}

/// Close every registered endpoint whose identity is not in `keep`. Called
/// once, from the child, immediately after `fork()` — and only after
/// [`restamp_all`] has re-stamped every entry with the child's pid, since
/// `close_for_bootstrap` goes through the same owner-pid check as a normal
/// `close()` and would reject every one of these closes while they still
/// read as owned by the parent.
pub(crate) fn prune_to(keep: &[String]) {
    for handle in snapshot() {
        if keep.iter().any(|id| id == handle.identity()) {
            continue;
        }
        handle.force_unlock();
        handle.close_for_bootstrap();
        remove(handle.identity());
    }
}

/// Re-stamps every registered endpoint — kept and pruned alike — with the
/// child's pid. Must run before [`prune_to`]: closing a non-kept endpoint
/// in the child is itself an owner-checked operation, and every endpoint
/// still reads as owned by the parent until this runs.
pub(crate) fn restamp_all(pid: u32) {
    for handle in snapshot() {
        handle.owner_pid_store(pid);
    }
}

/// Rebuilds every surviving endpoint's I/O driver registration. Must run
/// while the runtime that will actually drive the child's `target` future
/// is current on the calling thread — a registration made before `fork()`
/// is tied to the parent's driver, which nothing polls anymore once the
/// child stops driving it.
pub(crate) fn rebind_surviving() {
    for handle in snapshot() {
        handle.rebind();
    }
}
