/// Replay protection for one datagram read epoch.
///
/// Bit `n` of `seen` stands for sequence number `top - n`. Anything at or
/// below `top - 64` is treated as already seen.
///
/// Freshness and marking are separate steps: a record is only marked after
/// it authenticated, so a forged packet cannot burn a sequence number.
#[derive(Debug, Default, Clone)]
pub struct ReplayWindow {
    top: Option<u64>,
    seen: u64,
}

impl ReplayWindow {
    pub const SIZE: u64 = u64::BITS as u64;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fresh(&self, sequence: u64) -> bool {
        let Some(top) = self.top else {
            return true;
        };
        if sequence > top {
            return true;
        }
        match top - sequence {
            behind if behind >= Self::SIZE => false,
            behind => self.seen & (1 << behind) == 0,
        }
    }

    pub fn mark(&mut self, sequence: u64) {
        let top = match self.top {
            Some(top) => top,
            None => {
                self.top = Some(sequence);
                self.seen = 1;
                return;
            }
        };

        if sequence > top {
            let shift = sequence - top;
            self.seen = if shift >= Self::SIZE {
                1
            } else {
                (self.seen << shift) | 1
            };
            self.top = Some(sequence);
        } else if top - sequence < Self::SIZE {
            self.seen |= 1 << (top - sequence);
        }
    }

    /// Highest authenticated sequence number.
    pub fn high_water_mark(&self) -> Option<u64> {
        self.top
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(w: &mut ReplayWindow, sequence: u64) -> bool {
        let fresh = w.is_fresh(sequence);
        if fresh {
            w.mark(sequence);
        }
        fresh
    }

    #[test]
    fn empty_window_takes_anything() {
        let w = ReplayWindow::new();
        assert!(w.is_fresh(0));
        assert!(w.is_fresh(u64::MAX >> 16));
        assert_eq!(w.high_water_mark(), None);
    }

    #[test]
    fn duplicates() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 0));
        assert!(!accept(&mut w, 0));
        assert!(accept(&mut w, 1));
        assert!(!accept(&mut w, 1));
    }

    #[test]
    fn late_arrivals_inside_window() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 20));
        assert!(accept(&mut w, 18));
        assert!(accept(&mut w, 19));
        assert!(!accept(&mut w, 18));
        assert_eq!(w.high_water_mark(), Some(20));
    }

    #[test]
    fn window_edge() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 200));
        assert!(!w.is_fresh(200 - 64));
        assert!(accept(&mut w, 200 - 63));
        assert!(!accept(&mut w, 200 - 63));
    }

    #[test]
    fn jump_clears_history() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 2));
        assert!(accept(&mut w, 1000));
        assert!(accept(&mut w, 999));
        assert!(!w.is_fresh(2));
        assert!(!w.is_fresh(1000));
    }

    #[test]
    fn fresh_check_has_no_side_effect() {
        let mut w = ReplayWindow::new();
        assert!(w.is_fresh(7));
        assert!(w.is_fresh(7));
        w.mark(7);
        assert!(!w.is_fresh(7));
        assert!(w.is_fresh(8));
    }

    #[test]
    fn every_higher_number_advances() {
        let mut w = ReplayWindow::new();
        for sequence in [5u64, 69, 70, 640, 12_345] {
            assert!(accept(&mut w, sequence));
            assert_eq!(w.high_water_mark(), Some(sequence));
        }
        assert!(!w.is_fresh(12_345 - 64));
        assert!(w.is_fresh(12_345 - 63));
    }
}
