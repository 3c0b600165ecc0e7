use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pipeline-wide cancellation flag.
///
/// Every thread of a pipeline run holds a clone. Once cancelled the token stays
/// cancelled; there is no reset.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request stop. Returns true if this call performed the transition.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Guard that cancels the token if the holding thread unwinds.
    pub fn cancel_on_panic(&self) -> PanicGuard {
        PanicGuard {
            token: self.clone(),
        }
    }
}

pub struct PanicGuard {
    token: StopToken,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.token.cancel();
        }
    }
}
