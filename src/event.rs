//! Normalized key events
//!
//! Raw evdev reports carry a value of 1 (press), 0 (release) or 2
//! (autorepeat). Only presses and releases leave the capture loop; the
//! [`RepeatFilter`] also folds duplicate presses for a key that is already
//! held, so a held key counts once per physical down/up cycle.

use std::collections::HashSet;
use std::time::Instant;

/// Identifier for a registered input device (stable for one registration)
pub type DeviceId = u64;

/// Direction of a key transition that reaches consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Down,
    Up,
}

/// Classification of a raw evdev key value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTransition {
    Down,
    Up,
    Repeat,
}

impl RawTransition {
    /// Classify an `EV_KEY` value, `None` for values the kernel never sends
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(RawTransition::Down),
            0 => Some(RawTransition::Up),
            2 => Some(RawTransition::Repeat),
            _ => None,
        }
    }
}

/// A raw key report read from a device, before filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReport {
    pub code: u16,
    pub value: i32,
}

/// A normalized key transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// Device that produced the event
    pub device: DeviceId,
    /// evdev key code (e.g. 30 for KEY_A)
    pub code: u16,
    pub transition: Transition,
    /// Monotonic time the report was decoded
    pub at: Instant,
}

impl KeyEvent {
    pub fn is_down(&self) -> bool {
        self.transition == Transition::Down
    }
}

/// Per-device held-key tracking that drops repeats
#[derive(Debug, Default)]
pub struct RepeatFilter {
    held: HashSet<u16>,
}

impl RepeatFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn a raw report into a key event, or `None` if it must be dropped.
    ///
    /// Releases for keys that were never seen pressed (held before the device
    /// was opened) are dropped along with repeats.
    pub fn normalize(&mut self, device: DeviceId, report: RawReport, at: Instant) -> Option<KeyEvent> {
        let transition = match RawTransition::from_value(report.value)? {
            RawTransition::Down if self.held.insert(report.code) => Transition::Down,
            RawTransition::Up if self.held.remove(&report.code) => Transition::Up,
            _ => return None,
        };

        Some(KeyEvent {
            device,
            code: report.code,
            transition,
            at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(code: u16, value: i32) -> RawReport {
        RawReport { code, value }
    }

    #[test]
    fn test_classify_values() {
        assert_eq!(RawTransition::from_value(1), Some(RawTransition::Down));
        assert_eq!(RawTransition::from_value(0), Some(RawTransition::Up));
        assert_eq!(RawTransition::from_value(2), Some(RawTransition::Repeat));
        assert_eq!(RawTransition::from_value(7), None);
    }

    #[test]
    fn test_held_key_emits_single_down() {
        let mut filter = RepeatFilter::new();
        let now = Instant::now();

        let mut downs = 0;
        let mut ups = 0;
        for value in [1, 2, 2, 2, 2, 0, 1, 2, 0] {
            if let Some(ev) = filter.normalize(3, report(30, value), now) {
                match ev.transition {
                    Transition::Down => downs += 1,
                    Transition::Up => ups += 1,
                }
            }
        }

        assert_eq!(downs, 2);
        assert_eq!(ups, 2);
        // Nothing is held any more, so a stray release is dropped
        assert!(filter.normalize(3, report(30, 0), now).is_none());
    }

    #[test]
    fn test_duplicate_press_is_dropped() {
        let mut filter = RepeatFilter::new();
        let now = Instant::now();
        assert!(filter.normalize(1, report(31, 1), now).is_some());
        assert!(filter.normalize(1, report(31, 1), now).is_none());
    }

    #[test]
    fn test_orphan_release_is_dropped() {
        let mut filter = RepeatFilter::new();
        assert!(filter.normalize(1, report(42, 0), Instant::now()).is_none());
    }

    #[test]
    fn test_event_carries_device_and_code() {
        let mut filter = RepeatFilter::new();
        let now = Instant::now();
        let ev = filter.normalize(9, report(57, 1), now).unwrap();
        assert_eq!(ev.device, 9);
        assert_eq!(ev.code, 57);
        assert!(ev.is_down());
        assert_eq!(ev.at, now);
    }
}
