//! Process-wide pause-until deadline shared by every pipeline.
//!
//! Any pipeline that receives a transient-retryable outcome writes the
//! deadline; every remote-submitting entry point reads it first. Already
//! submitted operations are never aborted by a pause.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Single-writer-many-reader guarded pause deadline.
#[derive(Debug, Default)]
pub struct Throttle {
    deadline: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause new remote submissions for `duration` from now. A shorter
    /// duration never moves an existing deadline earlier.
    pub fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut deadline = self.deadline.lock();
        match *deadline {
            Some(existing) if existing >= until => {}
            _ => *deadline = Some(until),
        }
    }

    /// Whether new remote submissions are currently gated.
    pub fn is_paused(&self) -> bool {
        let mut deadline = self.deadline.lock();
        match *deadline {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Deadline elapsed; clear it so reads stay cheap.
                *deadline = None;
                false
            }
            None => false,
        }
    }

    /// Time left until submissions resume, if paused.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.deadline.lock();
        deadline.and_then(|until| until.checked_duration_since(Instant::now()))
    }

    pub fn clear(&self) {
        *self.deadline.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_gates_until_deadline() {
        let throttle = Throttle::new();
        assert!(!throttle.is_paused());

        throttle.pause_for(Duration::from_millis(30));
        assert!(throttle.is_paused());
        assert!(throttle.remaining().is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(!throttle.is_paused());
        assert!(throttle.remaining().is_none());
    }

    #[test]
    fn shorter_pause_never_shrinks_deadline() {
        let throttle = Throttle::new();
        throttle.pause_for(Duration::from_secs(60));
        throttle.pause_for(Duration::from_millis(1));

        let remaining = throttle.remaining().expect("still paused");
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn clear_lifts_the_pause() {
        let throttle = Throttle::new();
        throttle.pause_for(Duration::from_secs(60));
        throttle.clear();
        assert!(!throttle.is_paused());
    }
}
