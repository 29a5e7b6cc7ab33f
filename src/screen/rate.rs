//! Capture cadence and quality tiers.
//!
//! The policy is stateless: each decision only looks at the two current
//! booleans, attention (someone is looking at the local preview) and
//! visibility (the producer is foregrounded).

use std::time::Duration;
use tokio::sync::watch;

use super::encoder::EncodeSettings;
use super::{ACTIVE_INTERVAL_MS, HIDDEN_FLOOR_MS, HIDDEN_PENALTY, IDLE_INTERVAL_MS};

#[derive(Debug, Clone, PartialEq)]
pub struct RatePolicy {
    /// Delay between captures while attention is active
    pub active_interval: Duration,
    /// Delay while nobody is watching the preview
    pub idle_interval: Duration,
    /// Multiplier applied to either interval when hidden
    pub hidden_penalty: u32,
    /// Lower bound on the delay when hidden
    pub hidden_floor: Duration,
    pub active_settings: EncodeSettings,
    pub idle_settings: EncodeSettings,
    /// Used whenever the producer is hidden, regardless of attention
    pub hidden_settings: EncodeSettings,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_millis(ACTIVE_INTERVAL_MS),
            idle_interval: Duration::from_millis(IDLE_INTERVAL_MS),
            hidden_penalty: HIDDEN_PENALTY,
            hidden_floor: Duration::from_millis(HIDDEN_FLOOR_MS),
            active_settings: EncodeSettings::new(0.8, 1920),
            idle_settings: EncodeSettings::new(0.5, 960),
            hidden_settings: EncodeSettings::new(0.4, 640),
        }
    }
}

impl RatePolicy {
    pub fn next_delay(&self, attention_active: bool, visible: bool) -> Duration {
        let base = if attention_active {
            self.active_interval
        } else {
            self.idle_interval
        };
        if visible {
            base
        } else {
            (base * self.hidden_penalty).max(self.hidden_floor)
        }
    }

    pub fn settings(&self, attention_active: bool, visible: bool) -> EncodeSettings {
        match (attention_active, visible) {
            (_, false) => self.hidden_settings,
            (true, true) => self.active_settings,
            (false, true) => self.idle_settings,
        }
    }
}

/// Read side of the attention and visibility signals
#[derive(Debug, Clone)]
pub struct Signals {
    attention: watch::Receiver<bool>,
    visible: watch::Receiver<bool>,
}

impl Signals {
    pub fn attention(&self) -> bool {
        *self.attention.borrow()
    }

    pub fn visible(&self) -> bool {
        *self.visible.borrow()
    }

    /// Fixed signals, for callers with no UI
    pub fn constant(attention: bool, visible: bool) -> Self {
        let source = SignalSource::new(attention, visible);
        source.signals()
    }
}

/// Owned by the UI; the only writer of the signals.
#[derive(Debug)]
pub struct SignalSource {
    attention: watch::Sender<bool>,
    visible: watch::Sender<bool>,
}

impl SignalSource {
    pub fn new(attention: bool, visible: bool) -> Self {
        let (attention, _) = watch::channel(attention);
        let (visible, _) = watch::channel(visible);
        Self { attention, visible }
    }

    pub fn signals(&self) -> Signals {
        Signals {
            attention: self.attention.subscribe(),
            visible: self.visible.subscribe(),
        }
    }

    /// Returns true when this was an edge (the value changed)
    pub fn set_attention(&self, active: bool) -> bool {
        self.attention.send_if_modified(|current| replace_if_changed(current, active))
    }

    /// Returns true when this was an edge (the value changed)
    pub fn set_visible(&self, visible: bool) -> bool {
        self.visible.send_if_modified(|current| replace_if_changed(current, visible))
    }
}

fn replace_if_changed(current: &mut bool, next: bool) -> bool {
    if *current == next {
        false
    } else {
        *current = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_delay_truth_table() {
        let policy = RatePolicy::default();
        assert_eq!(policy.next_delay(true, true), ms(16));
        assert_eq!(policy.next_delay(false, true), ms(100));
        // 16 * 3 = 48, floored at 100
        assert_eq!(policy.next_delay(true, false), ms(100));
        assert_eq!(policy.next_delay(false, false), ms(300));
    }

    #[test]
    fn test_hidden_floor_and_penalty() {
        let policy = RatePolicy::default();
        for attention in [true, false] {
            let hidden = policy.next_delay(attention, false);
            assert!(hidden >= ms(100));
            assert!(hidden >= policy.next_delay(attention, true));
        }
        assert!(policy.next_delay(false, false) >= policy.next_delay(true, false) * 2);
    }

    #[test]
    fn test_floor_applies_to_custom_intervals() {
        let policy = RatePolicy {
            active_interval: ms(1),
            idle_interval: ms(10),
            hidden_penalty: 2,
            hidden_floor: ms(250),
            ..RatePolicy::default()
        };
        assert_eq!(policy.next_delay(true, false), ms(250));
        assert_eq!(policy.next_delay(false, false), ms(250));
        assert_eq!(policy.next_delay(false, true), ms(10));
    }

    #[test]
    fn test_settings_table() {
        let policy = RatePolicy::default();
        let active = policy.settings(true, true);
        let idle = policy.settings(false, true);
        assert!(active.quality > idle.quality);
        assert!(active.max_width > idle.max_width);
        assert_eq!(policy.settings(true, false), policy.hidden_settings);
        assert_eq!(policy.settings(false, false), policy.hidden_settings);
    }

    #[test]
    fn test_signal_edges() {
        let source = SignalSource::new(false, true);
        let signals = source.signals();
        assert!(!signals.attention());

        assert!(source.set_attention(true));
        assert!(!source.set_attention(true));
        assert!(signals.attention());

        assert!(source.set_visible(false));
        assert!(!signals.visible());
    }
}
