use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

/// Tracks backend work in flight for one conversation so the poller can stay
/// out of the way of sends and never overlap itself.
#[derive(Debug, Default)]
pub struct SyncActivity {
    sends: AtomicUsize,
    polling: AtomicBool,
}

impl SyncActivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin_send(self: &Arc<Self>) -> SendGuard {
        self.sends.fetch_add(1, Ordering::AcqRel);
        SendGuard {
            activity: Arc::clone(self),
        }
    }

    /// `None` while another poll holds the slot.
    pub fn try_begin_poll(self: &Arc<Self>) -> Option<PollGuard> {
        self.polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollGuard {
                activity: Arc::clone(self),
            })
    }

    pub fn sends_in_flight(&self) -> usize {
        self.sends.load(Ordering::Acquire)
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }
}

pub struct SendGuard {
    activity: Arc<SyncActivity>,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.activity.sends.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct PollGuard {
    activity: Arc<SyncActivity>,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.activity.polling.store(false, Ordering::Release);
    }
}
