//! Shared AVD state
//!
//! [`StateStore`] wraps a `watch` channel: every write goes through
//! `send_if_modified`, so writes are serialized, readers always see a whole
//! [`Inventory`], and subscribers are woken only when something changed.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;

use avdemon_core::prelude::*;
use avdemon_core::{AvdImage, LifecyclePhase, TransitionIntent};

/// Overall state of the image list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryStatus {
    /// No enumeration has finished yet
    #[default]
    Loading,
    /// At least one image is known
    Ready,
    /// Enumeration found no images
    Empty,
    /// Enumeration did not finish in time
    TimedOut,
}

/// One image and its observed state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvdRecord {
    pub image: AvdImage,
    pub is_running: bool,
    /// Start or stop in flight; at most one per image
    pub intent: Option<TransitionIntent>,
    /// A start was dispatched and its confirmation task is still running
    pub awaiting_confirmation: bool,
    pub updated_at: DateTime<Local>,
}

impl AvdRecord {
    fn new(image: AvdImage) -> Self {
        Self {
            image,
            is_running: false,
            intent: None,
            awaiting_confirmation: false,
            updated_at: Local::now(),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::derive(self.is_running, self.intent)
    }

    /// Whether the lifecycle controller currently owns this record
    pub fn is_claimed(&self) -> bool {
        self.intent.is_some() || self.awaiting_confirmation
    }

    fn touch(&mut self) {
        self.updated_at = Local::now();
    }
}

/// Authoritative name → record mapping
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Inventory {
    pub status: InventoryStatus,
    pub records: BTreeMap<String, AvdRecord>,
}

impl Inventory {
    pub fn get(&self, name: &str) -> Option<&AvdRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Images with a start in flight
    pub fn starting(&self) -> BTreeSet<String> {
        self.with_intent(TransitionIntent::Starting)
    }

    /// Images with a stop in flight
    pub fn stopping(&self) -> BTreeSet<String> {
        self.with_intent(TransitionIntent::Stopping)
    }

    pub fn running(&self) -> BTreeSet<String> {
        self.records
            .values()
            .filter(|r| r.is_running)
            .map(|r| r.image.name.clone())
            .collect()
    }

    /// Row to show in place of an empty list
    pub fn placeholder(&self) -> Option<AvdImage> {
        match self.status {
            InventoryStatus::Empty => Some(AvdImage::no_images_placeholder()),
            InventoryStatus::TimedOut => Some(AvdImage::timed_out_placeholder()),
            InventoryStatus::Loading | InventoryStatus::Ready => None,
        }
    }

    fn with_intent(&self, intent: TransitionIntent) -> BTreeSet<String> {
        self.records
            .values()
            .filter(|r| r.intent == Some(intent))
            .map(|r| r.image.name.clone())
            .collect()
    }
}

/// Single-writer store of the [`Inventory`]
#[derive(Debug, Clone)]
pub struct StateStore {
    tx: Arc<watch::Sender<Inventory>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Inventory::default());
        Self { tx: Arc::new(tx) }
    }

    /// Current state
    pub fn snapshot(&self) -> Inventory {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every effective change
    pub fn subscribe(&self) -> watch::Receiver<Inventory> {
        self.tx.subscribe()
    }

    pub fn record(&self, name: &str) -> Option<AvdRecord> {
        self.tx.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tx.borrow().contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    /// Mark an enumeration pass as in progress
    pub fn begin_loading(&self) {
        self.tx.send_if_modified(|inv| {
            let changed = inv.status != InventoryStatus::Loading;
            inv.status = InventoryStatus::Loading;
            changed
        });
    }

    /// Replace the image list wholesale.
    ///
    /// Running state, intent and pending confirmation survive for names that
    /// are still present; vanished names are dropped.
    pub fn replace_images(&self, images: Vec<AvdImage>) -> InventoryStatus {
        let status = if images.is_empty() {
            InventoryStatus::Empty
        } else {
            InventoryStatus::Ready
        };

        self.tx.send_if_modified(|inv| {
            let mut previous = std::mem::take(&mut inv.records);
            let mut changed = inv.status != status;

            for image in images {
                let name = image.name.clone();
                let record = match previous.remove(&name) {
                    Some(mut record) => {
                        if record.image != image {
                            record.image = image;
                            record.touch();
                            changed = true;
                        }
                        record
                    }
                    None => {
                        changed = true;
                        AvdRecord::new(image)
                    }
                };
                inv.records.insert(name, record);
            }

            if !previous.is_empty() {
                debug!("Dropping {} vanished image(s)", previous.len());
                changed = true;
            }
            inv.status = status;
            changed
        });

        status
    }

    /// Enumeration timed out: forget every image
    pub fn mark_timed_out(&self) {
        self.tx.send_if_modified(|inv| {
            let changed = inv.status != InventoryStatus::TimedOut || !inv.records.is_empty();
            inv.records.clear();
            inv.status = InventoryStatus::TimedOut;
            changed
        });
    }

    /// Claim `name` for `intent`.
    ///
    /// Returns `Ok(false)` when another start or stop is already in flight.
    pub fn try_begin(&self, name: &str, intent: TransitionIntent) -> Result<bool> {
        let mut outcome = Err(Error::image_not_found(name));

        self.tx.send_if_modified(|inv| match inv.records.get_mut(name) {
            None => false,
            Some(record) if record.intent.is_some() => {
                outcome = Ok(false);
                false
            }
            Some(record) => {
                record.intent = Some(intent);
                record.touch();
                outcome = Ok(true);
                true
            }
        });

        outcome
    }

    /// Release the intent on `name`
    pub fn end_transition(&self, name: &str) {
        self.modify(name, |record| record.intent.take().is_some());
    }

    /// Set the observed running flag; returns whether it changed
    pub fn set_running(&self, name: &str, is_running: bool) -> bool {
        self.modify(name, |record| {
            let changed = record.is_running != is_running;
            record.is_running = is_running;
            changed
        })
    }

    pub fn set_awaiting_confirmation(&self, name: &str, awaiting: bool) {
        self.modify(name, |record| {
            let changed = record.awaiting_confirmation != awaiting;
            record.awaiting_confirmation = awaiting;
            changed
        });
    }

    /// Merge a detection pass: patch only records whose flag differs.
    ///
    /// Records owned by the lifecycle controller are left alone. Returns the
    /// `(name, is_running)` pairs that changed.
    pub fn apply_detection(&self, running: &HashSet<String>) -> Vec<(String, bool)> {
        let mut changes = Vec::new();

        self.tx.send_if_modified(|inv| {
            for (name, record) in inv.records.iter_mut() {
                if record.is_claimed() {
                    continue;
                }
                let observed = running.contains(name);
                if record.is_running != observed {
                    record.is_running = observed;
                    record.touch();
                    changes.push((name.clone(), observed));
                }
            }
            !changes.is_empty()
        });

        changes
    }

    /// Drop every intent and pending-confirmation flag, and leave `Loading`.
    ///
    /// Recovery for a record stuck in a transition; returns the names that
    /// were released.
    pub fn clear_intents(&self) -> Vec<String> {
        let mut cleared = Vec::new();

        self.tx.send_if_modified(|inv| {
            let mut changed = false;
            for (name, record) in inv.records.iter_mut() {
                if record.is_claimed() {
                    record.intent = None;
                    record.awaiting_confirmation = false;
                    record.touch();
                    cleared.push(name.clone());
                    changed = true;
                }
            }
            if inv.status == InventoryStatus::Loading {
                inv.status = if inv.records.is_empty() {
                    InventoryStatus::Empty
                } else {
                    InventoryStatus::Ready
                };
                changed = true;
            }
            changed
        });

        cleared
    }

    fn modify(&self, name: &str, apply: impl FnOnce(&mut AvdRecord) -> bool) -> bool {
        self.tx.send_if_modified(|inv| match inv.records.get_mut(name) {
            Some(record) => {
                let changed = apply(record);
                if changed {
                    record.touch();
                }
                changed
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(names: &[&str]) -> StateStore {
        let store = StateStore::new();
        store.replace_images(names.iter().map(|n| AvdImage::new(*n)).collect());
        store
    }

    fn running(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_initial_state_is_loading() {
        let store = StateStore::new();
        let inv = store.snapshot();
        assert_eq!(inv.status, InventoryStatus::Loading);
        assert!(inv.is_empty());
        assert_eq!(inv.placeholder(), None);
    }

    #[test]
    fn test_zero_images_is_empty_status() {
        let store = StateStore::new();
        assert_eq!(store.replace_images(Vec::new()), InventoryStatus::Empty);
        assert_eq!(
            store.snapshot().placeholder().map(|p| p.name),
            Some("No_Emulators_Found".to_string())
        );
    }

    #[test]
    fn test_timed_out_clears_records() {
        let store = store_with(&["Pixel_7_API_33"]);
        store.mark_timed_out();

        let inv = store.snapshot();
        assert_eq!(inv.status, InventoryStatus::TimedOut);
        assert!(inv.is_empty());
        assert_eq!(
            inv.placeholder().map(|p| p.device),
            Some("SDK Configuration Needed".to_string())
        );
    }

    #[test]
    fn test_replace_carries_over_surviving_state() {
        let store = store_with(&["A", "B"]);
        store.set_running("A", true);
        assert!(store.try_begin("B", TransitionIntent::Stopping).unwrap());

        store.replace_images(vec![AvdImage::new("A"), AvdImage::new("B"), AvdImage::new("C")]);

        let inv = store.snapshot();
        assert!(inv.get("A").unwrap().is_running);
        assert_eq!(inv.get("B").unwrap().intent, Some(TransitionIntent::Stopping));
        assert!(!inv.get("C").unwrap().is_running);

        store.replace_images(vec![AvdImage::new("C")]);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_single_intent_per_image() {
        let store = store_with(&["A"]);

        assert!(store.try_begin("A", TransitionIntent::Starting).unwrap());
        assert!(!store.try_begin("A", TransitionIntent::Starting).unwrap());
        assert!(!store.try_begin("A", TransitionIntent::Stopping).unwrap());
        assert_eq!(store.snapshot().starting(), BTreeSet::from(["A".to_string()]));
        assert!(store.snapshot().stopping().is_empty());

        store.end_transition("A");
        assert!(store.try_begin("A", TransitionIntent::Stopping).unwrap());
        assert_eq!(store.record("A").unwrap().phase(), LifecyclePhase::Stopping);
    }

    #[test]
    fn test_try_begin_unknown_image() {
        let store = store_with(&["A"]);
        let err = store.try_begin("missing", TransitionIntent::Starting).unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { .. }));
    }

    #[test]
    fn test_apply_detection_patches_only_differences() {
        let store = store_with(&["A", "B", "C"]);
        store.set_running("B", true);

        let changes = store.apply_detection(&running(&["A", "B"]));
        assert_eq!(changes, vec![("A".to_string(), true)]);

        let changes = store.apply_detection(&running(&[]));
        assert_eq!(changes.len(), 2);
        assert!(store.snapshot().running().is_empty());
    }

    #[test]
    fn test_apply_detection_skips_claimed_records() {
        let store = store_with(&["A", "B"]);
        store.set_running("A", true);
        store.set_awaiting_confirmation("A", true);
        store.try_begin("B", TransitionIntent::Starting).unwrap();

        let changes = store.apply_detection(&running(&["B"]));

        assert!(changes.is_empty());
        assert!(store.record("A").unwrap().is_running);
        assert!(!store.record("B").unwrap().is_running);
    }

    #[test]
    fn test_clear_intents_releases_stuck_records() {
        let store = store_with(&["A", "B", "C"]);
        assert!(store.try_begin("A", TransitionIntent::Starting).unwrap());
        store.set_awaiting_confirmation("B", true);
        store.set_running("C", true);
        store.begin_loading();

        let cleared = store.clear_intents();

        assert_eq!(cleared, vec!["A".to_string(), "B".to_string()]);
        let inventory = store.snapshot();
        assert_eq!(inventory.status, InventoryStatus::Ready);
        assert!(!inventory.get("A").unwrap().is_claimed());
        assert!(!inventory.get("B").unwrap().is_claimed());
        assert!(inventory.get("C").unwrap().is_running);
        // A released record can be claimed again
        assert!(store.try_begin("A", TransitionIntent::Stopping).unwrap());
    }

    #[tokio::test]
    async fn test_subscribers_notified_only_on_change() {
        let store = store_with(&["A"]);
        let mut rx = store.subscribe();
        rx.mark_unchanged();

        store.set_running("A", false);
        assert!(!rx.has_changed().unwrap());

        store.apply_detection(&running(&[]));
        assert!(!rx.has_changed().unwrap());

        store.set_running("A", true);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().get("A").unwrap().is_running);
    }
}
