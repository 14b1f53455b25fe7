//! Per-thread tracking of callback execution
//!
//! Every user callback runs inside a [`CallbackGuard`] tagged with the role
//! of the thread that invokes it:
//!
//! ```text
//!  Realtime      process, sync, timebase, buffer size, shutdown
//!                no server calls at all
//!  Notification  registrations, connects, renames, graph order, xrun, ...
//!                server calls allowed; activate/deactivate/close refused
//! ```
//!
//! Server-administrative calls consult [`ensure_admin_allowed`], lifecycle
//! changes [`ensure_lifecycle_allowed`].

use std::cell::Cell;

use crate::error::{Result, ViolationKind};

/// Which thread a callback runs on, as far as re-entrancy is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackRole {
    /// Process thread, or a callback invoked while the server is locked
    Realtime,
    /// Notification thread
    Notification,
}

thread_local! {
    static REALTIME_DEPTH: Cell<u32> = const { Cell::new(0) };
    static NOTIFICATION_DEPTH: Cell<u32> = const { Cell::new(0) };
}

fn depth(role: CallbackRole) -> &'static std::thread::LocalKey<Cell<u32>> {
    match role {
        CallbackRole::Realtime => &REALTIME_DEPTH,
        CallbackRole::Notification => &NOTIFICATION_DEPTH,
    }
}

/// Marks the current thread as executing a callback until dropped
pub(crate) struct CallbackGuard {
    role: CallbackRole,
}

impl CallbackGuard {
    pub(crate) fn enter(role: CallbackRole) -> Self {
        depth(role).with(|depth| depth.set(depth.get() + 1));
        CallbackGuard { role }
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        depth(self.role).with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn inside(role: CallbackRole) -> bool {
    depth(role).with(|depth| depth.get() > 0)
}

/// True while the calling thread is inside a client callback
pub fn in_callback() -> bool {
    inside(CallbackRole::Realtime) || inside(CallbackRole::Notification)
}

/// Innermost restriction in effect on this thread, if any
pub fn current_role() -> Option<CallbackRole> {
    if inside(CallbackRole::Realtime) {
        Some(CallbackRole::Realtime)
    } else if inside(CallbackRole::Notification) {
        Some(CallbackRole::Notification)
    } else {
        None
    }
}

/// Server queries and graph changes: refused only on the realtime role
pub(crate) fn ensure_admin_allowed() -> Result<()> {
    if inside(CallbackRole::Realtime) {
        Err(ViolationKind::CallbackContext.into())
    } else {
        Ok(())
    }
}

/// Activate, deactivate and close: refused from any callback
pub(crate) fn ensure_lifecycle_allowed() -> Result<()> {
    if in_callback() {
        Err(ViolationKind::CallbackContext.into())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_nesting() {
        assert!(!in_callback());
        {
            let _outer = CallbackGuard::enter(CallbackRole::Realtime);
            assert!(in_callback());
            {
                let _inner = CallbackGuard::enter(CallbackRole::Realtime);
                assert!(ensure_admin_allowed().is_err());
            }
            assert!(in_callback());
        }
        assert!(!in_callback());
        assert!(ensure_admin_allowed().is_ok());
        assert!(ensure_lifecycle_allowed().is_ok());
    }

    #[test]
    fn test_notification_role_allows_admin_only() {
        let _guard = CallbackGuard::enter(CallbackRole::Notification);
        assert_eq!(current_role(), Some(CallbackRole::Notification));
        assert!(ensure_admin_allowed().is_ok());
        assert!(ensure_lifecycle_allowed().is_err());

        let _nested = CallbackGuard::enter(CallbackRole::Realtime);
        assert_eq!(current_role(), Some(CallbackRole::Realtime));
        assert!(ensure_admin_allowed().is_err());
    }

    #[test]
    fn test_guard_is_per_thread() {
        let _guard = CallbackGuard::enter(CallbackRole::Realtime);
        let other = std::thread::spawn(in_callback).join().unwrap();
        assert!(!other);
    }
}
