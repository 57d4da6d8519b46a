//! Fatal assertion funnel.
//!
//! Every invariant violation detected by the framework ends up in
//! [`on_error`] together with the name of the module that detected it and a
//! numeric location id. The call never returns: after the optional
//! application handler has run, the current thread panics, which with the
//! workspace `panic = "abort"` profile halts the process.

use parking_lot::RwLock;

/// Application hook invoked on a fatal assertion, before the framework halts.
///
/// Typical handlers flush a log, light an LED or kick a reset. If the
/// handler returns, the framework panics anyway.
pub type AssertHandler = fn(module: &'static str, id: u32);

static HANDLER: RwLock<Option<AssertHandler>> = parking_lot::const_rwlock(None);

/// Installs the process-wide assertion handler.
pub fn set_assert_handler(handler: AssertHandler) {
    *HANDLER.write() = Some(handler);
}

/// Removes a previously installed handler.
pub fn reset_assert_handler() {
    *HANDLER.write() = None;
}

/// Reports a fatal error detected at `module:id`.
#[cold]
#[inline(never)]
pub fn on_error(module: &'static str, id: u32) -> ! {
    log::error!("assertion failed: {module}:{id}");

    let handler = *HANDLER.read();
    if let Some(handler) = handler {
        handler(module, id);
    }

    panic!("assertion failed: {module}:{id}");
}

/// Checks a precondition. Expects a `MODULE: &str` constant in scope.
#[macro_export]
macro_rules! q_require {
    ($id:expr, $cond:expr) => {
        if !($cond) {
            $crate::assert::on_error(MODULE, $id)
        }
    };
}

/// Checks an internal invariant. Expects a `MODULE: &str` constant in scope.
#[macro_export]
macro_rules! q_assert {
    ($id:expr, $cond:expr) => {
        if !($cond) {
            $crate::assert::on_error(MODULE, $id)
        }
    };
}

/// Unconditional fatal error. Expects a `MODULE: &str` constant in scope.
#[macro_export]
macro_rules! q_error {
    ($id:expr) => {
        $crate::assert::on_error(MODULE, $id)
    };
}

#[cfg(test)]
mod tests {
    const MODULE: &str = "test_mod";

    #[test]
    fn passing_checks_are_silent() {
        q_require!(1, 1 + 1 == 2);
        q_assert!(2, true);
    }

    #[test]
    #[should_panic(expected = "assertion failed: test_mod:7")]
    fn failed_require_reports_module_and_id() {
        let ready = false;
        q_require!(7, ready);
    }

    #[test]
    #[should_panic(expected = "test_mod:9")]
    fn error_is_unconditional() {
        q_error!(9);
    }
}
