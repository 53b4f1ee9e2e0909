use core::ops::BitOr;

/// Snapshot of the front panel buttons, one bit per button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Buttons(u8);

impl Buttons {
    pub const NONE: Buttons = Buttons(0);
    pub const F1: Buttons = Buttons(1 << 0);
    pub const F2: Buttons = Buttons(1 << 1);
    pub const F3: Buttons = Buttons(1 << 2);
    pub const F4: Buttons = Buttons(1 << 3);
    pub const S: Buttons = Buttons(1 << 4);
    const ALL: u8 = 0x1F;

    pub const fn from_bits(bits: u8) -> Self {
        Buttons(bits & Self::ALL)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Buttons) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Buttons {
    type Output = Buttons;

    fn bitor(self, rhs: Buttons) -> Buttons {
        Buttons(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchEvent {
    pub buttons: Buttons,
    pub repeating: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    pub poll_period_ms: u32,
    pub debounce_ms: u32,
    pub repeat_delay_ms: u32,
    pub repeat_period_ms: u32,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: 10,
            debounce_ms: 100,
            repeat_delay_ms: 1000,
            repeat_period_ms: 200,
        }
    }
}

/**
### Button debouncer with auto-repeat
* A combination must be stable for `debounce_ms` before it is reported
* Held F1..F4 repeat every `repeat_period_ms` after `repeat_delay_ms`
* S never repeats, it doubles as the abort button
*/
pub struct SwitchDebouncer {
    config: DebounceConfig,
    last_snapshot: Buttons,
    held_ms: u32,
}

impl SwitchDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config: DebounceConfig {
                poll_period_ms: config.poll_period_ms.max(1),
                repeat_period_ms: config.repeat_period_ms.max(1),
                ..config
            },
            last_snapshot: Buttons::NONE,
            held_ms: 0,
        }
    }

    pub fn config(&self) -> DebounceConfig {
        self.config
    }

    /// Feeds one snapshot, called every `poll_period_ms`.
    pub fn poll(&mut self, snapshot: Buttons) -> Option<SwitchEvent> {
        let stable = !snapshot.is_empty() && snapshot == self.last_snapshot;
        self.last_snapshot = snapshot;
        if !stable {
            self.held_ms = 0;
            return None;
        }

        let before = self.held_ms;
        self.held_ms = self.held_ms.saturating_add(self.config.poll_period_ms);

        if before < self.config.debounce_ms && self.held_ms >= self.config.debounce_ms {
            return Some(SwitchEvent {
                buttons: snapshot,
                repeating: false,
            });
        }

        if snapshot.contains(Buttons::S) || self.held_ms < self.config.repeat_delay_ms {
            return None;
        }
        let into_repeat = self.held_ms - self.config.repeat_delay_ms;
        if into_repeat % self.config.repeat_period_ms < self.config.poll_period_ms {
            return Some(SwitchEvent {
                buttons: snapshot,
                repeating: true,
            });
        }
        None
    }
}

impl Default for SwitchDebouncer {
    fn default() -> Self {
        Self::new(DebounceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(debouncer: &mut SwitchDebouncer, snapshot: Buttons, polls: usize) -> Vec<(usize, SwitchEvent)> {
        (0..polls)
            .filter_map(|i| debouncer.poll(snapshot).map(|event| (i, event)))
            .collect()
    }

    #[test]
    fn short_glitch_is_ignored() {
        let mut debouncer = SwitchDebouncer::default();
        assert!(feed(&mut debouncer, Buttons::F1, 5).is_empty());
        assert!(feed(&mut debouncer, Buttons::NONE, 5).is_empty());
        assert!(feed(&mut debouncer, Buttons::F1, 5).is_empty());
    }

    #[test]
    fn press_reported_once_after_debounce() {
        let mut debouncer = SwitchDebouncer::default();
        let events = feed(&mut debouncer, Buttons::F2, 50);
        assert_eq!(
            events,
            [(
                10,
                SwitchEvent {
                    buttons: Buttons::F2,
                    repeating: false
                }
            )]
        );
    }

    #[test]
    fn held_button_repeats() {
        let mut debouncer = SwitchDebouncer::default();
        let events = feed(&mut debouncer, Buttons::F3 | Buttons::F4, 161);
        let polls: Vec<usize> = events.iter().map(|(i, _)| *i).collect();
        // first poll only latches the snapshot
        assert_eq!(polls, [10, 100, 120, 140, 160]);
        assert!(events[1..].iter().all(|(_, e)| e.repeating));
        assert_eq!(events[0].1.buttons, Buttons::F3 | Buttons::F4);
    }

    #[test]
    fn select_does_not_repeat() {
        let mut debouncer = SwitchDebouncer::default();
        let events = feed(&mut debouncer, Buttons::S, 300);
        assert_eq!(events.len(), 1);
        assert!(!events[0].1.repeating);
    }

    #[test]
    fn changing_combination_restarts_debounce() {
        let mut debouncer = SwitchDebouncer::default();
        assert!(feed(&mut debouncer, Buttons::F1, 8).is_empty());
        let events = feed(&mut debouncer, Buttons::F1 | Buttons::F2, 11);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 10);
    }

    #[test]
    fn button_bits() {
        let both = Buttons::F1 | Buttons::S;
        assert_eq!(both.bits(), 0x11);
        assert!(both.contains(Buttons::S));
        assert!(!both.contains(Buttons::F2));
        assert_eq!(Buttons::from_bits(0xFF).bits(), 0x1F);
    }
}
