//! Timing breadcrumbs recorded through one transaction.

use std::time::Instant;

use heapless::String;
use log::debug;

use crate::config::{MAX_TIMINGS, TIMING_LABEL_SIZE};

/// Milliseconds since the previous breadcrumb of the same transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTiming {
    pub label: String<TIMING_LABEL_SIZE>,
    pub delta_ms: u32,
}

#[derive(Debug, Default)]
pub(crate) struct Timings {
    last: Option<Instant>,
    entries: heapless::Vec<PaymentTiming, MAX_TIMINGS>,
}

fn clip(label: &str) -> String<TIMING_LABEL_SIZE> {
    let mut out = String::new();
    for ch in label.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

impl Timings {
    /// Forget earlier breadcrumbs and start the clock
    pub fn start(&mut self, label: &str) {
        self.entries.clear();
        self.last = Some(Instant::now());
        self.push(label, 0);
    }

    pub fn mark(&mut self, label: &str) {
        let now = Instant::now();
        let delta = self
            .last
            .map(|last| now.duration_since(last).as_millis().min(u128::from(u32::MAX)) as u32)
            .unwrap_or(0);
        self.last = Some(now);
        self.push(label, delta);
    }

    fn push(&mut self, label: &str, delta_ms: u32) {
        let entry = PaymentTiming {
            label: clip(label),
            delta_ms,
        };
        if self.entries.push(entry).is_err() {
            debug!("timing table full; dropped {label}");
        }
    }

    /// Hand the breadcrumbs over and reset
    pub fn take(&mut self) -> Vec<PaymentTiming> {
        self.last = None;
        let entries = self.entries.to_vec();
        self.entries.clear();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_clipped_and_table_bounded() {
        let mut timings = Timings::default();
        timings.start("start");
        timings.mark("a very long label for a breadcrumb");
        for _ in 0..MAX_TIMINGS {
            timings.mark("x");
        }

        let taken = timings.take();
        assert_eq!(taken.len(), MAX_TIMINGS);
        assert_eq!(taken[0].label.as_str(), "start");
        assert_eq!(taken[0].delta_ms, 0);
        assert_eq!(taken[1].label.len(), TIMING_LABEL_SIZE);
        assert!(timings.take().is_empty());
    }
}
