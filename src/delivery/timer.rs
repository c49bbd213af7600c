use std::time::{Duration, Instant};

/// One-shot deadline owned by a state machine. Nothing runs in the
/// background; the owner asks whether it has fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// (Re)start; a running timer is replaced. A deadline past what
    /// `Instant` can represent never fires.
    pub fn start(&mut self, now: Instant, period: Duration) {
        self.deadline = now.checked_add(period);
        if self.deadline.is_none() {
            log::warn!("Timer period {:?} overflows the clock, timer disarmed", period);
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once, the first time it is checked at or after its deadline
    pub fn fired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of several optional deadlines
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_once() {
        let t0 = Instant::now();
        let mut timer = Timer::default();
        assert!(!timer.fired(t0));

        timer.start(t0, Duration::from_millis(100));
        assert!(!timer.fired(t0 + Duration::from_millis(99)));
        assert!(timer.fired(t0 + Duration::from_millis(100)));
        assert!(!timer.fired(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let t0 = Instant::now();
        let mut timer = Timer::default();
        timer.cancel();
        timer.start(t0, Duration::from_secs(1));
        timer.cancel();
        timer.cancel();
        assert!(!timer.is_running());
        assert!(!timer.fired(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_overflowing_period_does_not_panic() {
        let t0 = Instant::now();
        let mut timer = Timer::default();
        timer.start(t0, Duration::MAX);
        assert!(!timer.is_running());
        assert!(!timer.fired(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_earliest() {
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(1);
        assert_eq!(earliest([None, Some(later), Some(t0)]), Some(t0));
        assert_eq!(earliest([None, None]), None);
    }
}
