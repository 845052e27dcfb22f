//! One-shot timer backed by a pollable descriptor

use crate::descriptor::Descriptor;
use std::time::{Duration, Instant};

/// One-shot timer
///
/// Firing does not clear the timer by itself: the owner observes expiry with
/// `take_fired`, which disarms it, and then sets the next deadline if needed.
#[derive(Clone, Default)]
pub struct Timer {
    descriptor: Descriptor,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to fire after `delay`, replacing any previous deadline
    pub fn set(&self, delay: Duration) {
        self.descriptor
            .set_deadline(Some(Instant::now().checked_add(delay).unwrap_or_else(far_future)));
    }

    pub fn cancel(&self) {
        self.descriptor.set_deadline(None);
    }

    /// Return true and disarm if the deadline has passed
    pub fn take_fired(&self) -> bool {
        match self.descriptor.deadline() {
            Some(deadline) if deadline <= Instant::now() => {
                self.descriptor.set_deadline(None);
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.descriptor.deadline()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor.clone()
    }
}

fn far_future() -> Instant {
    // Roughly 30 years; only reached with absurd delays
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timer_fires_once() {
        let timer = Timer::new();
        assert!(!timer.take_fired());

        timer.set(Duration::from_millis(10));
        assert!(timer.is_armed());
        assert!(!timer.take_fired());

        thread::sleep(Duration::from_millis(20));
        assert!(timer.take_fired());
        assert!(!timer.is_armed());
        assert!(!timer.take_fired());
    }

    #[test]
    fn test_timer_cancel() {
        let timer = Timer::new();
        timer.set(Duration::ZERO);
        timer.cancel();
        assert!(!timer.take_fired());
    }

    #[test]
    fn test_timer_descriptor_ready_after_deadline() {
        let timer = Timer::new();
        let descriptor = timer.descriptor();
        timer.set(Duration::from_millis(5));
        assert!(!descriptor.is_ready());

        thread::sleep(Duration::from_millis(10));
        assert!(descriptor.is_ready());
    }
}
