//! Panic-safe invocation of user callbacks

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use super::CallbackKind;
use crate::context::CallbackGuard;
use crate::diagnostics;

/// Run `callback` as a `kind` callback
///
/// Marks the thread as being inside a callback of the kind's role for the
/// duration. A panic is caught and reported through the error sink, and
/// `neutral` is returned in place of the callback's result.
pub(crate) fn invoke<R>(kind: CallbackKind, neutral: R, callback: impl FnOnce() -> R) -> R {
    let _guard = CallbackGuard::enter(kind.role());
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result,
        Err(payload) => {
            report_panic(kind, payload.as_ref());
            neutral
        }
    }
}

fn report_panic(kind: CallbackKind, payload: &(dyn Any + Send)) {
    let reason = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    diagnostics::error(&format!("{} callback panicked: {}", kind, reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::in_callback;

    #[test]
    fn test_returns_callback_result() {
        let value = invoke(CallbackKind::Sync, false, || {
            assert!(in_callback());
            true
        });
        assert!(value);
        assert!(!in_callback());
    }

    #[test]
    fn test_panic_yields_neutral_value() {
        let value = invoke(CallbackKind::GraphOrder, 7, || -> i32 { panic!("boom") });
        assert_eq!(value, 7);
        assert!(!in_callback());
    }
}
