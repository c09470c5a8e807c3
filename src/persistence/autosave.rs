use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

pub const DEFAULT_SAVE_DELAY: Duration = Duration::from_secs(60);

/// Coalesces change notifications into one deferred flush.
///
/// The first [`trigger`](Debouncer::trigger) arms a one-shot timer; triggers
/// during the delay only mark the state dirty. At expiry the flush runs once
/// if the state is still dirty.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    dirty: Arc<AtomicBool>,
    armed: Arc<AtomicBool>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            dirty: Arc::new(AtomicBool::new(false)),
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Clears the dirty flag, e.g. after an immediate save.
    pub fn clear(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn trigger<F>(&self, flush: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dirty.store(true, Ordering::SeqCst);
        if self.armed.swap(true, Ordering::SeqCst) {
            return;
        }

        let delay = self.delay;
        let dirty = Arc::clone(&self.dirty);
        let armed = Arc::clone(&self.armed);
        thread::spawn(move || {
            thread::sleep(delay);
            armed.store(false, Ordering::SeqCst);
            if dirty.swap(false, Ordering::SeqCst) {
                flush();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Instant};

    use super::*;

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn bursts_flush_once() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let flushes = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let flushes = Arc::clone(&flushes);
            debouncer.trigger(move || {
                flushes.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(debouncer.is_dirty());
        assert!(wait_for(|| flushes.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_dirty());
    }

    #[test]
    fn cleared_state_skips_flush() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushes);
        debouncer.trigger(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.clear();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(flushes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearms_after_expiry() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let flushes = Arc::new(AtomicUsize::new(0));
        for round in 1..=2 {
            let counter = Arc::clone(&flushes);
            debouncer.trigger(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            assert!(wait_for(|| flushes.load(Ordering::SeqCst) == round));
        }
    }
}
