//! Routes object-creation events to subscribed functions.
//!
//! Delivery contract: **at-least-once**. Every event matching a subscription is
//! queued exactly once at emission time, but a delivery that is polled and never
//! acknowledged goes back on the queue by `redeliver_unacked`. Consumers therefore
//! see duplicates and must deduplicate on `(key, version)`; the router never drops
//! an event to avoid one. No ordering holds across keys, nor between rapid
//! writes to the same key.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::event::{EventSink, ObjectCreatedEvent};
use crate::identity::{bucket_arn, OBJECT_STORE_PRINCIPAL};

/// Key predicate of a subscription. An unset side matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotificationFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl NotificationFilter {
    pub fn suffix(suffix: impl Into<String>) -> Self {
        Self {
            prefix: None,
            suffix: Some(suffix.into()),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.prefix.as_deref().unwrap_or_default().is_empty()
            && self.suffix.as_deref().unwrap_or_default().is_empty()
    }

    pub fn matches(&self, key: &str) -> bool {
        let prefix_ok = self
            .prefix
            .as_deref()
            .map(|prefix| key.starts_with(prefix))
            .unwrap_or(true);
        let suffix_ok = self
            .suffix
            .as_deref()
            .map(|suffix| key.ends_with(suffix))
            .unwrap_or(true);
        prefix_ok && suffix_ok
    }

    /// Two filters overlap when some key could match both. Storage platforms
    /// reject overlapping configurations for the same event type.
    pub fn overlaps(&self, other: &Self) -> bool {
        let prefixes_overlap = match (self.prefix.as_deref(), other.prefix.as_deref()) {
            (Some(a), Some(b)) => a.starts_with(b) || b.starts_with(a),
            _ => true,
        };
        let suffixes_overlap = match (self.suffix.as_deref(), other.suffix.as_deref()) {
            (Some(a), Some(b)) => a.ends_with(b) || b.ends_with(a),
            _ => true,
        };
        prefixes_overlap && suffixes_overlap
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub source_bucket: String,
    pub target_function: String,
    pub filter: NotificationFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: u64,
    pub subscription_id: String,
    pub target_function: String,
    pub event: ObjectCreatedEvent,
    pub attempt: u32,
}

/// Resource-based invoke rights consulted at subscribe time.
pub trait InvokePermissions {
    fn allows_invoke(&self, principal: &str, source_arn: &str, function: &str) -> bool;
}

#[derive(Debug, Default)]
struct RouterState {
    sources: BTreeSet<String>,
    subscriptions: BTreeMap<String, Subscription>,
    pending: VecDeque<Delivery>,
    in_flight: BTreeMap<u64, Delivery>,
    next_delivery_id: u64,
}

#[derive(Debug, Default)]
pub struct EventRouter {
    state: Mutex<RouterState>,
}

/// Whether `subscribe` created, replaced or kept a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeResult {
    Created,
    Replaced,
    Unchanged,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a store as existing so subscriptions may reference it.
    pub fn attach_source(&self, bucket: &str) {
        self.lock().sources.insert(bucket.to_string());
    }

    pub fn subscribe(
        &self,
        subscription: Subscription,
        permissions: &impl InvokePermissions,
    ) -> Result<SubscribeResult> {
        let mut state = self.lock();

        if !state.sources.contains(&subscription.source_bucket) {
            return Err(Error::misconfigured(
                &subscription.id,
                format!(
                    "source store '{}' does not exist",
                    subscription.source_bucket
                ),
            ));
        }

        let source_arn = bucket_arn(&subscription.source_bucket);
        if !permissions.allows_invoke(
            OBJECT_STORE_PRINCIPAL,
            &source_arn,
            &subscription.target_function,
        ) {
            return Err(Error::misconfigured(
                &subscription.id,
                format!(
                    "function '{}' has not granted invoke permission to {OBJECT_STORE_PRINCIPAL} for {source_arn}",
                    subscription.target_function
                ),
            ));
        }

        if let Some(conflict) = state.subscriptions.values().find(|existing| {
            existing.id != subscription.id
                && existing.source_bucket == subscription.source_bucket
                && existing.filter.overlaps(&subscription.filter)
        }) {
            return Err(Error::misconfigured(
                &subscription.id,
                format!("filter overlaps subscription '{}'", conflict.id),
            ));
        }

        let result = match state.subscriptions.get(&subscription.id) {
            Some(existing) if *existing == subscription => SubscribeResult::Unchanged,
            Some(_) => SubscribeResult::Replaced,
            None => SubscribeResult::Created,
        };
        if result != SubscribeResult::Unchanged {
            info!(
                component = "event_router",
                event = "subscription_configured",
                subscription_id = %subscription.id,
                source = %subscription.source_bucket,
                target_function = %subscription.target_function,
            );
            state
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }
        Ok(result)
    }

    pub fn subscription(&self, id: &str) -> Option<Subscription> {
        self.lock().subscriptions.get(id).cloned()
    }

    /// Takes the next queued delivery and holds it in flight until `ack`.
    pub fn poll(&self) -> Option<Delivery> {
        let mut state = self.lock();
        let delivery = state.pending.pop_front()?;
        state
            .in_flight
            .insert(delivery.delivery_id, delivery.clone());
        Some(delivery)
    }

    pub fn ack(&self, delivery_id: u64) -> bool {
        self.lock().in_flight.remove(&delivery_id).is_some()
    }

    /// Requeues every unacknowledged delivery with its attempt count bumped.
    /// Returns how many deliveries went back on the queue.
    pub fn redeliver_unacked(&self) -> usize {
        let mut state = self.lock();
        let in_flight = std::mem::take(&mut state.in_flight);
        let count = in_flight.len();
        for (_, mut delivery) in in_flight {
            delivery.attempt += 1;
            state.pending.push_back(delivery);
        }
        if count > 0 {
            debug!(
                component = "event_router",
                event = "redelivery_scheduled",
                count
            );
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }
}

impl EventSink for EventRouter {
    fn emit(&self, event: ObjectCreatedEvent) {
        let mut state = self.lock();
        let targets: Vec<(String, String)> = state
            .subscriptions
            .values()
            .filter(|subscription| {
                subscription.source_bucket == event.bucket && subscription.filter.matches(&event.key)
            })
            .map(|subscription| {
                (
                    subscription.id.clone(),
                    subscription.target_function.clone(),
                )
            })
            .collect();

        for (subscription_id, target_function) in targets {
            state.next_delivery_id += 1;
            let delivery_id = state.next_delivery_id;
            debug!(
                component = "event_router",
                event = "delivery_queued",
                delivery_id,
                subscription_id = %subscription_id,
                key = %event.key,
            );
            state.pending.push_back(Delivery {
                delivery_id,
                subscription_id,
                target_function,
                event: event.clone(),
                attempt: 1,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::event::OBJECT_CREATED_PUT;

    struct AllowAll;

    impl InvokePermissions for AllowAll {
        fn allows_invoke(&self, _principal: &str, _source_arn: &str, _function: &str) -> bool {
            true
        }
    }

    struct DenyAll;

    impl InvokePermissions for DenyAll {
        fn allows_invoke(&self, _principal: &str, _source_arn: &str, _function: &str) -> bool {
            false
        }
    }

    fn pdf_subscription(id: &str) -> Subscription {
        Subscription {
            id: id.to_string(),
            source_bucket: "insurance-emails".to_string(),
            target_function: "email-receiver".to_string(),
            filter: NotificationFilter::suffix(".pdf"),
        }
    }

    fn event(key: &str, sequencer: u64) -> ObjectCreatedEvent {
        ObjectCreatedEvent {
            bucket: "insurance-emails".to_string(),
            key: key.to_string(),
            version_id: None,
            event_name: OBJECT_CREATED_PUT.to_string(),
            sequencer,
            size: 3,
            content_hash: "hash".to_string(),
            event_time: Utc::now(),
        }
    }

    #[test]
    fn filter_matches_prefix_and_suffix() {
        let filter = NotificationFilter::suffix(".pdf").with_prefix("incoming/");
        assert!(filter.matches("incoming/claim123.pdf"));
        assert!(!filter.matches("incoming/claim123.txt"));
        assert!(!filter.matches("archive/claim123.pdf"));
        assert!(NotificationFilter::default().matches("anything"));
    }

    #[test]
    fn overlapping_filters_are_detected() {
        let pdf = NotificationFilter::suffix(".pdf");
        let incoming_pdf = NotificationFilter::suffix(".pdf").with_prefix("incoming/");
        let eml = NotificationFilter::suffix(".eml");
        assert!(pdf.overlaps(&incoming_pdf));
        assert!(!pdf.overlaps(&eml));
        assert!(NotificationFilter::default().overlaps(&eml));
    }

    #[test]
    fn subscribe_without_invoke_permission_fails() {
        let router = EventRouter::new();
        router.attach_source("insurance-emails");

        let error = router
            .subscribe(pdf_subscription("pdf"), &DenyAll)
            .expect_err("subscription should be rejected");
        assert!(matches!(error, Error::NotificationMisconfiguration { .. }));
        assert!(router.subscription("pdf").is_none());
    }

    #[test]
    fn subscribe_to_unknown_source_fails() {
        let router = EventRouter::new();
        let error = router
            .subscribe(pdf_subscription("pdf"), &AllowAll)
            .expect_err("subscription should be rejected");
        assert!(error.to_string().contains("does not exist"));
    }

    #[test]
    fn resubscribing_identical_configuration_is_unchanged() {
        let router = EventRouter::new();
        router.attach_source("insurance-emails");
        let first = router
            .subscribe(pdf_subscription("pdf"), &AllowAll)
            .expect("subscribe");
        let second = router
            .subscribe(pdf_subscription("pdf"), &AllowAll)
            .expect("subscribe");
        assert_eq!(first, SubscribeResult::Created);
        assert_eq!(second, SubscribeResult::Unchanged);
    }

    #[test]
    fn overlapping_subscription_on_same_source_is_rejected() {
        let router = EventRouter::new();
        router.attach_source("insurance-emails");
        router
            .subscribe(pdf_subscription("pdf"), &AllowAll)
            .expect("subscribe");

        let error = router
            .subscribe(pdf_subscription("pdf-again"), &AllowAll)
            .expect_err("overlap should be rejected");
        assert!(error.to_string().contains("overlaps"));
    }

    #[test]
    fn unacked_delivery_is_redelivered_with_bumped_attempt() {
        let router = EventRouter::new();
        router.attach_source("insurance-emails");
        router
            .subscribe(pdf_subscription("pdf"), &AllowAll)
            .expect("subscribe");

        router.emit(event("incoming/a.pdf", 1));
        router.emit(event("incoming/b.txt", 2));
        assert_eq!(router.pending_len(), 1);

        let first = router.poll().expect("delivery");
        assert_eq!(first.attempt, 1);
        assert!(router.poll().is_none());

        assert_eq!(router.redeliver_unacked(), 1);
        let retry = router.poll().expect("redelivery");
        assert_eq!(retry.delivery_id, first.delivery_id);
        assert_eq!(retry.attempt, 2);
        assert!(router.ack(retry.delivery_id));
        assert_eq!(router.redeliver_unacked(), 0);
        assert_eq!(router.in_flight_len(), 0);
    }
}
