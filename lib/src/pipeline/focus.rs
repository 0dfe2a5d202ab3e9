use super::context::PipelineContext;
use super::stage::StageControl;
use crate::callbacks::MsgType;

use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace, warn};

pub(crate) const AUTOFOCUS: &str = "autofocus";

#[derive(Default)]
struct FocusState {
    active: bool,
    result: Option<bool>,
    cancelled: bool,
}

/// Completion signal of the autofocus in progress.
pub(crate) struct FocusSignal {
    state: Mutex<FocusState>,
    cond: Condvar,
}

impl FocusSignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Default::default(),
            cond: Condvar::new(),
        }
    }

    /// Start a new focus operation. Returns false if one is already running.
    pub(crate) fn arm(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.active {
            return false;
        }
        *state = FocusState {
            active: true,
            ..Default::default()
        };
        true
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// Called when the device reports the end of the sweep.
    pub(crate) fn complete(&self, success: bool) {
        let mut state = self.state.lock().unwrap();
        if !state.active {
            trace!("Focus completion without autofocus in progress");
            return;
        }
        state.result = Some(success);
        self.cond.notify_all();
    }

    /// Returns whether there was a focus operation to cancel.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.active {
            return false;
        }
        state.cancelled = true;
        self.cond.notify_all();
        true
    }

    /// Block until the device reports completion or the operation is
    /// cancelled. A cancelled operation always reports failure.
    fn wait(&self) -> bool {
        let state = self.state.lock().unwrap();
        let state = self
            .cond
            .wait_while(state, |s| s.result.is_none() && !s.cancelled)
            .unwrap();
        !state.cancelled && state.result.unwrap_or(false)
    }

    fn finish(&self) {
        self.state.lock().unwrap().active = false;
    }
}

pub(crate) fn autofocus_loop(ctx: Arc<PipelineContext>, control: StageControl) {
    let success = match ctx.device.start_autofocus() {
        Ok(()) => ctx.focus.wait(),
        Err(e) => {
            warn!("Cannot start autofocus: {}", e);
            false
        }
    };
    ctx.focus.finish();
    debug!("Autofocus finished (success: {})", success);

    // Teardown cancels focus without expecting a notification.
    if control.is_armed() {
        ctx.messages.notify(MsgType::FOCUS, success as i32, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_focus_completes() {
        let signal = Arc::new(FocusSignal::new());
        assert!(signal.arm());
        assert!(!signal.arm());

        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        thread::sleep(Duration::from_millis(10));
        signal.complete(true);
        assert!(waiter.join().unwrap());
        signal.finish();
        assert!(!signal.is_active());
    }

    #[test]
    fn test_cancel_reports_failure() {
        let signal = FocusSignal::new();
        assert!(!signal.cancel());
        assert!(signal.arm());
        assert!(signal.cancel());
        signal.complete(true);
        assert!(!signal.wait());
    }

    #[test]
    fn test_completion_without_focus_is_ignored() {
        let signal = FocusSignal::new();
        signal.complete(true);
        assert!(signal.arm());
        signal.cancel();
        assert!(!signal.wait());
    }
}
