//! Meltdown window: debounce for reconcile storms
//!
//! A resource records the time of its last successful reconcile in an
//! annotation. Events arriving within `duration` of that time are deferred
//! until the window closes, so a burst of upstream changes collapses into a
//! single downstream action.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Annotation holding the last successful reconcile (RFC 3339)
pub const LAST_RECONCILE_ANNOTATION: &str = "deckhand.io/last-reconcile";

/// Debounce window anchored at a resource's last reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeltdownWindow {
    start: Option<DateTime<Utc>>,
    duration: Duration,
}

impl MeltdownWindow {
    pub fn new(last_reconcile: Option<DateTime<Utc>>, duration: Duration) -> Self {
        Self {
            start: last_reconcile,
            duration,
        }
    }

    /// Build the window from a resource's annotations
    ///
    /// A missing or unparsable timestamp yields an empty window.
    pub fn from_annotations(duration: Duration, annotations: &BTreeMap<String, String>) -> Self {
        let start = annotations
            .get(LAST_RECONCILE_ANNOTATION)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc));
        Self::new(start, duration)
    }

    /// End of the window, if one is open at all
    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        let duration = chrono::Duration::from_std(self.duration).ok()?;
        self.start.and_then(|s| s.checked_add_signed(duration))
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_some()
    }

    /// Time until the window closes, `None` once `now` is outside it
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let end = self.ends_at()?;
        if now < end {
            (end - now).to_std().ok()
        } else {
            None
        }
    }
}

/// Record `now` as the last successful reconcile
pub fn set_last_reconcile(annotations: &mut BTreeMap<String, String>, now: DateTime<Utc>) {
    annotations.insert(LAST_RECONCILE_ANNOTATION.to_string(), now.to_rfc3339());
}
