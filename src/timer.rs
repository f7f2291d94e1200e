use std::time::{Duration, Instant};

/// Retransmission timeout that doubles on every attempt up to a ceiling.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    start_rto: Duration,
    max_rto: Duration,
    rto: Duration,
    attempts: usize,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, max_rto: Duration) -> Self {
        Self {
            start_rto,
            max_rto: max_rto.max(start_rto),
            rto: start_rto,
            attempts: 0,
        }
    }

    /// Back to the initial timeout, after a flight got through.
    pub fn reset(&mut self) {
        self.rto = self.start_rto;
        self.attempts = 0;
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn attempt(&mut self) {
        self.attempts += 1;
        self.rto = (self.rto * 2).min(self.max_rto);
    }
}

/// A deadline that may or may not be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never fires.
    Disabled,
    /// Armed on the next call that knows the current time.
    Unarmed,
    Armed(Instant),
}

impl Timeout {
    pub fn arm(&mut self, now: Instant, after: Duration) {
        *self = Timeout::Armed(now + after);
    }

    /// Arm relative to `now` if not already armed.
    pub fn arm_if_unarmed(&mut self, now: Instant, after: Duration) {
        if *self == Timeout::Unarmed {
            self.arm(now, after);
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Timeout::Armed(at) if now >= *at)
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Timeout::Armed(at) => Some(*at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attempts() {
        let mut exp = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(exp.rto(), Duration::from_secs(1));
        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(2));
        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(4));
        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(5));
        exp.attempt();
        assert_eq!(exp.rto(), Duration::from_secs(5));
        assert_eq!(exp.attempts(), 4);

        exp.reset();
        assert_eq!(exp.rto(), Duration::from_secs(1));
        assert_eq!(exp.attempts(), 0);
    }

    #[test]
    fn timeout_states() {
        let now = Instant::now();
        let mut t = Timeout::Unarmed;
        assert!(!t.is_expired(now));
        t.arm_if_unarmed(now, Duration::from_millis(10));
        assert_eq!(t.deadline(), Some(now + Duration::from_millis(10)));
        // Already armed, keeps the first deadline.
        t.arm_if_unarmed(now, Duration::from_secs(10));
        assert!(t.is_expired(now + Duration::from_millis(10)));
        assert!(!Timeout::Disabled.is_expired(now + Duration::from_secs(1000)));
    }
}
