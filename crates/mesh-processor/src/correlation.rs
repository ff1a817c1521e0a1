//! Multi-gateway message correlation
//!
//! The same text message usually reaches the broker through several
//! gateways. Receipts of one message id are merged into a [`MessageGroup`]
//! that is emitted once no new receipt arrived for the window duration:
//!
//! ```text
//! absent --first receipt--> open --timer fires--> emitted (absent again)
//!                            ^  |
//!                            +--+ new receipt, timer re-armed
//! ```
//!
//! Each open group owns one timer task. Re-arming aborts the task and bumps
//! the group generation, so a timer that already woke up cannot emit a
//! group that has since been re-armed. The state mutex is never held
//! across an await point.

use mesh_shared::{CorrelationSettings, EndpointConfig, RawEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// One gateway's delivery of a message
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReceipt {
    /// `gatewayId`, or the endpoint name when the packet had none
    pub gateway_key: String,
    pub gateway_id: Option<String>,
    pub hop_limit: Option<u32>,
    pub rx_rssi: Option<i32>,
    pub rx_snr: Option<f32>,
    pub endpoint: String,
}

impl GatewayReceipt {
    fn from_event(event: &RawEvent) -> Self {
        Self {
            gateway_key: gateway_key(event),
            gateway_id: event.gateway_id.clone(),
            hop_limit: event.hop_limit,
            rx_rssi: event.rx_rssi,
            rx_snr: event.rx_snr,
            endpoint: event.source_endpoint.clone(),
        }
    }

    /// Relayed without radio reception, e.g. over another MQTT bridge
    pub fn is_relay_only(&self) -> bool {
        let rssi = self.rx_rssi.unwrap_or(0);
        let snr = self.rx_snr.unwrap_or(0.0);
        rssi == 0 && snr == 0.0
    }
}

fn gateway_key(event: &RawEvent) -> String {
    event
        .gateway_id
        .clone()
        .unwrap_or_else(|| event.source_endpoint.clone())
}

/// All receipts of one logical message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageGroup {
    pub message_id: u32,
    /// Event of the first receipt
    pub event: RawEvent,
    /// Receipts in arrival order, one per gateway
    pub gateways: Vec<GatewayReceipt>,
}

impl MessageGroup {
    fn new(message_id: u32, event: &RawEvent) -> Self {
        Self {
            message_id,
            event: event.clone(),
            gateways: vec![GatewayReceipt::from_event(event)],
        }
    }

    /// Record a receipt, replacing an earlier one from the same gateway
    fn record(&mut self, receipt: GatewayReceipt) {
        match self
            .gateways
            .iter_mut()
            .find(|existing| existing.gateway_key == receipt.gateway_key)
        {
            Some(existing) => *existing = receipt,
            None => self.gateways.push(receipt),
        }
    }
}

/// Why a message is not correlated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    NotifyDisabled,
    Direct,
    DeniedSender,
    MissingMessageId,
    TopicNotAllowed,
}

/// Result of offering a message event to the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Ineligible(IneligibleReason),
    /// Identical receipt already recorded in the open group
    Duplicate,
    /// First receipt, a new group was opened
    Opened,
    /// Added to an open group and the timer was re-armed
    Joined,
}

/// Receipt identity used by the dedup guard
type ReceiptKey = (u64, u32, String, String);

/// Set of recorded receipts
///
/// Cleared in bulk by the first insert after the interval has elapsed.
struct DedupGuard {
    seen: HashSet<ReceiptKey>,
    interval: Duration,
    cleared_at: Instant,
}

impl DedupGuard {
    fn new(interval: Duration) -> Self {
        Self {
            seen: HashSet::new(),
            interval,
            cleared_at: Instant::now(),
        }
    }

    /// Returns `false` when the receipt was already seen
    fn insert(&mut self, key: ReceiptKey) -> bool {
        if self.cleared_at.elapsed() >= self.interval {
            debug!(entries = self.seen.len(), "Clearing receipt dedup guard");
            self.seen.clear();
            self.cleared_at = Instant::now();
        }
        self.seen.insert(key)
    }
}

struct OpenGroup {
    group: MessageGroup,
    /// Distinguishes successive groups of the same message id
    epoch: u64,
    generation: u64,
    timer: JoinHandle<()>,
}

struct WindowState {
    groups: HashMap<u32, OpenGroup>,
    dedup: DedupGuard,
    next_epoch: u64,
    next_generation: u64,
}

impl WindowState {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Debounced correlation of message receipts
///
/// Emitted groups are delivered on the channel returned by [`CorrelationWindow::new`].
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct CorrelationWindow {
    settings: Arc<CorrelationSettings>,
    notify_endpoints: Arc<HashSet<String>>,
    state: Arc<Mutex<WindowState>>,
    emitted: mpsc::UnboundedSender<MessageGroup>,
}

impl CorrelationWindow {
    pub fn new(
        settings: CorrelationSettings,
        endpoints: &[EndpointConfig],
    ) -> (Self, mpsc::UnboundedReceiver<MessageGroup>) {
        let (emitted, rx) = mpsc::unbounded_channel();

        let notify_endpoints = endpoints
            .iter()
            .filter(|endpoint| endpoint.notify)
            .map(|endpoint| endpoint.name.clone())
            .collect();

        let state = WindowState {
            groups: HashMap::new(),
            dedup: DedupGuard::new(settings.dedup_clear_interval),
            next_epoch: 0,
            next_generation: 0,
        };

        let window = Self {
            settings: Arc::new(settings),
            notify_endpoints: Arc::new(notify_endpoints),
            state: Arc::new(Mutex::new(state)),
            emitted,
        };

        (window, rx)
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        // A panic while holding the lock cannot leave the maps half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether an event may be correlated and notified
    pub fn eligibility(&self, event: &RawEvent) -> Result<u32, IneligibleReason> {
        if !self.notify_endpoints.contains(&event.source_endpoint) {
            return Err(IneligibleReason::NotifyDisabled);
        }
        if event.is_direct() {
            return Err(IneligibleReason::Direct);
        }
        if self.settings.denied_senders.contains(&event.origin_id.0) {
            return Err(IneligibleReason::DeniedSender);
        }
        let Some(message_id) = event.message_id else {
            return Err(IneligibleReason::MissingMessageId);
        };

        let allowed = event.full_topic.as_deref().is_some_and(|topic| {
            self.settings
                .allowed_topic_prefixes
                .iter()
                .any(|prefix| topic.starts_with(prefix.as_str()))
        });
        if !allowed {
            return Err(IneligibleReason::TopicNotAllowed);
        }

        Ok(message_id)
    }

    /// Offer a receipt of a message event
    pub fn offer(&self, event: &RawEvent) -> OfferOutcome {
        let message_id = match self.eligibility(event) {
            Ok(id) => id,
            Err(reason) => return OfferOutcome::Ineligible(reason),
        };

        let receipt = GatewayReceipt::from_event(event);
        let mut state = self.lock();

        let epoch = match state.groups.get(&message_id) {
            Some(open) => open.epoch,
            None => {
                state.next_epoch += 1;
                state.next_epoch
            }
        };

        let key = (
            epoch,
            message_id,
            receipt.gateway_key.clone(),
            receipt.endpoint.clone(),
        );
        if !state.dedup.insert(key) {
            return OfferOutcome::Duplicate;
        }

        let generation = state.generation();
        let timer = self.arm(message_id, generation);

        match state.groups.get_mut(&message_id) {
            Some(open) => {
                open.timer.abort();
                open.timer = timer;
                open.generation = generation;
                open.group.record(receipt);

                debug!(
                    message_id = message_id,
                    gateways = open.group.gateways.len(),
                    "Joined message group"
                );
                OfferOutcome::Joined
            }
            None => {
                state.groups.insert(
                    message_id,
                    OpenGroup {
                        group: MessageGroup::new(message_id, event),
                        epoch,
                        generation,
                        timer,
                    },
                );

                debug!(message_id = message_id, origin_id = %event.origin_id, "Opened message group");
                OfferOutcome::Opened
            }
        }
    }

    fn arm(&self, message_id: u32, generation: u64) -> JoinHandle<()> {
        let window = self.clone();
        // Measured from the receipt, not from the first poll of the task
        let deadline = Instant::now() + self.settings.window;

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            window.fire(message_id, generation);
        })
    }

    fn fire(&self, message_id: u32, generation: u64) {
        let group = {
            let mut state = self.lock();
            match state.groups.get(&message_id) {
                Some(open) if open.generation == generation => {
                    state.groups.remove(&message_id).map(|open| open.group)
                }
                _ => None,
            }
        };

        if let Some(group) = group {
            self.emit(group);
        }
    }

    fn emit(&self, group: MessageGroup) {
        info!(
            message_id = group.message_id,
            origin_id = %group.event.origin_id,
            gateways = group.gateways.len(),
            "Message group complete"
        );

        #[cfg(feature = "metrics")]
        metrics::counter!("mesh_processor.message_groups_emitted").increment(1);

        if self.emitted.send(group).is_err() {
            debug!("Emitted group channel closed");
        }
    }

    /// Emit every open group immediately
    pub fn flush(&self) {
        let groups: Vec<MessageGroup> = {
            let mut state = self.lock();
            state
                .groups
                .drain()
                .map(|(_, open)| {
                    open.timer.abort();
                    open.group
                })
                .collect()
        };

        for group in groups {
            self.emit(group);
        }
    }

    /// Number of groups waiting for their timer
    pub fn open_groups(&self) -> usize {
        self.lock().groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mesh_shared::{EndpointKind, NodeId};
    use serde_json::json;

    const WINDOW: Duration = Duration::from_secs(7);

    fn endpoints() -> Vec<EndpointConfig> {
        ["msk", "spb"]
            .into_iter()
            .map(|name| EndpointConfig {
                name: name.to_string(),
                address: format!("mqtt://{}.example.org", name),
                kind: EndpointKind::TopicSubscribe,
                notify: name == "msk",
                username: None,
                password: None,
            })
            .collect()
    }

    fn window() -> (CorrelationWindow, mpsc::UnboundedReceiver<MessageGroup>) {
        CorrelationWindow::new(CorrelationSettings::default(), &endpoints())
    }

    fn message(gateway: &str) -> RawEvent {
        RawEvent {
            source_endpoint: "msk".to_string(),
            full_topic: Some(format!("msh/msk/2/e/LongFast/{}", gateway)),
            topic_channel: Some("LongFast".to_string()),
            topic_user: Some(gateway.to_string()),
            event_name: "onMessagePacket".to_string(),
            event_type: "string".to_string(),
            payload: json!("hello"),
            origin_id: NodeId(2_482_595_192),
            to: Some(0xffff_ffff),
            message_id: Some(383_448_021),
            gateway_id: Some(gateway.to_string()),
            hop_limit: Some(3),
            rx_rssi: Some(-97),
            rx_snr: Some(6.25),
            timestamp: Utc::now(),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn elapse(duration: Duration) {
        tokio::time::advance(duration).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_gateways_one_notification() {
        let (window, mut rx) = window();

        assert_eq!(window.offer(&message("!aaaa0001")), OfferOutcome::Opened);
        elapse(Duration::from_secs(3)).await;
        assert_eq!(window.offer(&message("!aaaa0002")), OfferOutcome::Joined);
        elapse(Duration::from_secs(3)).await;
        assert_eq!(window.offer(&message("!aaaa0003")), OfferOutcome::Joined);

        elapse(WINDOW).await;

        let group = rx.try_recv().unwrap();
        let keys: Vec<&str> = group.gateways.iter().map(|g| g.gateway_key.as_str()).collect();
        assert_eq!(keys, vec!["!aaaa0001", "!aaaa0002", "!aaaa0003"]);
        assert!(rx.try_recv().is_err());
        assert_eq!(window.open_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_resets_timer() {
        let (window, mut rx) = window();

        window.offer(&message("!aaaa0001"));
        elapse(Duration::from_secs(5)).await;
        window.offer(&message("!aaaa0002"));

        // 8s after the first receipt, 3s after the second
        elapse(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());

        elapse(Duration::from_secs(4)).await;
        assert_eq!(rx.try_recv().unwrap().gateways.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_after_emission_starts_new_group() {
        let (window, mut rx) = window();

        window.offer(&message("!aaaa0001"));
        elapse(WINDOW + Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv().unwrap().gateways.len(), 1);

        // Same gateway again, after the window fired
        assert_eq!(window.offer(&message("!aaaa0001")), OfferOutcome::Opened);
        elapse(WINDOW + Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv().unwrap().gateways.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_receipt_ignored_without_reset() {
        let (window, mut rx) = window();

        window.offer(&message("!aaaa0001"));
        elapse(Duration::from_secs(5)).await;
        assert_eq!(window.offer(&message("!aaaa0001")), OfferOutcome::Duplicate);

        // Fires at the original deadline
        elapse(Duration::from_secs(2)).await;
        let group = rx.try_recv().unwrap();
        assert_eq!(group.gateways.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_gateway_other_endpoint_overwrites() {
        let endpoints: Vec<EndpointConfig> = endpoints()
            .into_iter()
            .map(|mut e| {
                e.notify = true;
                e
            })
            .collect();
        let (window, mut rx) = CorrelationWindow::new(CorrelationSettings::default(), &endpoints);

        window.offer(&message("!aaaa0001"));
        let mut relayed = message("!aaaa0001");
        relayed.source_endpoint = "spb".to_string();
        relayed.rx_rssi = Some(-80);
        assert_eq!(window.offer(&relayed), OfferOutcome::Joined);

        elapse(WINDOW).await;
        let group = rx.try_recv().unwrap();
        assert_eq!(group.gateways.len(), 1);
        assert_eq!(group.gateways[0].rx_rssi, Some(-80));
        assert_eq!(group.gateways[0].endpoint, "spb");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ineligible_messages_never_emitted() {
        let settings = CorrelationSettings {
            denied_senders: [2_000_000_000].into_iter().collect(),
            ..Default::default()
        };
        let (window, mut rx) = CorrelationWindow::new(settings, &endpoints());

        let mut direct = message("!aaaa0001");
        direct.to = Some(0x1234_5678);
        assert_eq!(
            window.offer(&direct),
            OfferOutcome::Ineligible(IneligibleReason::Direct)
        );

        let mut other_topic = message("!aaaa0001");
        other_topic.full_topic = Some("msh/spb/2/e/LongFast/!aaaa0001".to_string());
        assert_eq!(
            window.offer(&other_topic),
            OfferOutcome::Ineligible(IneligibleReason::TopicNotAllowed)
        );

        let mut no_topic = message("!aaaa0001");
        no_topic.full_topic = None;
        assert_eq!(
            window.offer(&no_topic),
            OfferOutcome::Ineligible(IneligibleReason::TopicNotAllowed)
        );

        let mut denied = message("!aaaa0001");
        denied.origin_id = NodeId(2_000_000_000);
        assert_eq!(
            window.offer(&denied),
            OfferOutcome::Ineligible(IneligibleReason::DeniedSender)
        );

        let mut silent_endpoint = message("!aaaa0001");
        silent_endpoint.source_endpoint = "spb".to_string();
        assert_eq!(
            window.offer(&silent_endpoint),
            OfferOutcome::Ineligible(IneligibleReason::NotifyDisabled)
        );

        let mut no_id = message("!aaaa0001");
        no_id.message_id = None;
        assert_eq!(
            window.offer(&no_id),
            OfferOutcome::Ineligible(IneligibleReason::MissingMessageId)
        );

        elapse(WINDOW * 2).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(window.open_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_messages_are_independent() {
        let (window, mut rx) = window();

        window.offer(&message("!aaaa0001"));
        let mut other = message("!aaaa0001");
        other.message_id = Some(1);
        window.offer(&other);
        assert_eq!(window.open_groups(), 2);

        elapse(WINDOW).await;
        let mut ids = vec![rx.try_recv().unwrap().message_id, rx.try_recv().unwrap().message_id];
        ids.sort();
        assert_eq!(ids, vec![1, 383_448_021]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_emits_open_groups() {
        let (window, mut rx) = window();

        window.offer(&message("!aaaa0001"));
        window.flush();

        assert_eq!(rx.try_recv().unwrap().message_id, 383_448_021);
        assert_eq!(window.open_groups(), 0);

        elapse(WINDOW).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_measured_from_receipt() {
        let (window, mut rx) = window();

        window.offer(&message("!aaaa0001"));
        // Time passes before the timer task gets its first poll
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert!(rx.try_recv().is_err());

        elapse(Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv().unwrap().gateways.len(), 1);
        assert_eq!(window.open_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_measured_from_latest_receipt() {
        let (window, mut rx) = window();

        window.offer(&message("!aaaa0001"));
        elapse(Duration::from_secs(4)).await;
        window.offer(&message("!aaaa0002"));
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert!(rx.try_recv().is_err());

        elapse(Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv().unwrap().gateways.len(), 2);
    }

    #[test]
    fn test_relay_only_detection() {
        let mut receipt = GatewayReceipt::from_event(&message("!aaaa0001"));
        assert!(!receipt.is_relay_only());

        receipt.rx_rssi = Some(0);
        receipt.rx_snr = Some(0.0);
        assert!(receipt.is_relay_only());

        receipt.rx_rssi = None;
        receipt.rx_snr = None;
        assert!(receipt.is_relay_only());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_guard_bulk_clear() {
        let mut guard = DedupGuard::new(Duration::from_secs(600));
        let key = (1, 7, "!a".to_string(), "msk".to_string());

        assert!(guard.insert(key.clone()));
        assert!(!guard.insert(key.clone()));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(guard.insert(key));
        assert_eq!(guard.seen.len(), 1);
    }
}
