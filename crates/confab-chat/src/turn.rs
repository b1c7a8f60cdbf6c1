//! Running one assistant turn end to end

use crate::error::Result;
use crate::status::{ChatStatus, ChatTarget, StreamingCoordinator, TurnHandle};
use crate::store::{MessageStore, StoredMessage};
use chrono::{DateTime, Utc};
use confab_billing::{CreditLedger, Reconciliation};
use confab_core::{MessagePart, PartAccumulator, Role, StreamEvent, TokenUsage};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_stream::Stream;

/// How often partial parts are written while streaming
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(250);

/// Floor for the snapshot interval; tokio intervals cannot be zero
const MIN_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(1);

/// Turn execution settings
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Time between persisted snapshots of partial parts
    pub snapshot_interval: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

/// Identifies the turn to run and who pays for it
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    pub conversation_id: String,
    /// The already-stored user message that token counts attach to
    pub user_message_id: String,
    /// Id for the assistant message this turn writes
    pub assistant_message_id: String,
    pub model: String,
    /// Start of the user's current subscription period
    pub period_start: DateTime<Utc>,
}

impl TurnRequest {
    /// The coordinator slot for this turn
    pub fn target(&self) -> ChatTarget {
        ChatTarget::Conversation(self.conversation_id.clone())
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The stream finished normally
    Completed,
    /// The turn was cancelled; partial parts were kept
    Aborted,
    /// The provider or transport failed; partial parts were kept
    Failed,
}

/// Everything a finished turn produced
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub parts: Vec<MessagePart>,
    pub usage: Option<TokenUsage>,
    /// Credits this turn cost on its own
    pub credits: u64,
    pub reconciliation: Option<Reconciliation>,
    pub error: Option<String>,
    /// Number of partial snapshots written before the final one
    pub snapshots: usize,
}

/// Drives provider events through a [`PartAccumulator`] into the message store
pub struct TurnDriver {
    store: Arc<dyn MessageStore>,
    coordinator: Arc<StreamingCoordinator>,
    ledger: Option<Arc<CreditLedger>>,
    config: TurnConfig,
}

impl TurnDriver {
    /// Create a driver without billing
    pub fn new(store: Arc<dyn MessageStore>, coordinator: Arc<StreamingCoordinator>) -> Self {
        Self {
            store,
            coordinator,
            ledger: None,
            config: TurnConfig::default(),
        }
    }

    /// Bill finished turns through `ledger`
    pub fn with_ledger(mut self, ledger: Arc<CreditLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Override the turn settings
    pub fn with_config(mut self, config: TurnConfig) -> Self {
        self.config = config;
        self
    }

    /// The coordinator turns register with
    pub fn coordinator(&self) -> &Arc<StreamingCoordinator> {
        &self.coordinator
    }

    /// Register a turn with the coordinator. The returned handle cancels it.
    pub fn begin(&self, request: &TurnRequest) -> TurnHandle {
        self.coordinator.start_sending(request.target())
    }

    /// Register and run a turn in one go
    pub async fn run<S>(&self, request: &TurnRequest, events: S) -> Result<TurnOutcome>
    where
        S: Stream<Item = confab_core::Result<StreamEvent>> + Send + Unpin,
    {
        let handle = self.begin(request);
        self.drive(request, &handle, events).await
    }

    /// Consume `events` for a turn registered with [`begin`](Self::begin).
    ///
    /// Cancelling `handle` stops reading, but the parts collected so far are
    /// still finalized and stored.
    pub async fn drive<S>(
        &self,
        request: &TurnRequest,
        handle: &TurnHandle,
        events: S,
    ) -> Result<TurnOutcome>
    where
        S: Stream<Item = confab_core::Result<StreamEvent>> + Send + Unpin,
    {
        let result = self.drive_inner(request, handle, events).await;
        let failed = match &result {
            Ok(outcome) => outcome.status == TurnStatus::Failed,
            Err(_) => true,
        };
        if failed {
            handle.set_status(ChatStatus::Error);
        }
        self.coordinator.finish_turn(handle);
        result
    }

    async fn drive_inner<S>(
        &self,
        request: &TurnRequest,
        handle: &TurnHandle,
        mut events: S,
    ) -> Result<TurnOutcome>
    where
        S: Stream<Item = confab_core::Result<StreamEvent>> + Send + Unpin,
    {
        let placeholder = StoredMessage::new(
            &request.user_id,
            &request.conversation_id,
            &request.assistant_message_id,
            Role::Assistant,
            &request.model,
        );
        self.store.append(placeholder).await?;
        tracing::debug!(
            "Turn {} started for {}/{}",
            handle.turn_id(),
            request.conversation_id,
            request.assistant_message_id
        );

        let cancel = handle.cancel_token();
        let mut accumulator = PartAccumulator::new();
        let mut ticker = tokio::time::interval(self.config.snapshot_interval.max(MIN_SNAPSHOT_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let mut persisted_revision = accumulator.revision();
        let mut snapshots = 0;
        let mut usage = None;
        let mut status = TurnStatus::Completed;
        let mut error = None;
        let mut streaming = false;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::debug!("Turn {} aborted", handle.turn_id());
                    status = TurnStatus::Aborted;
                    break;
                }
                _ = ticker.tick() => {
                    if accumulator.revision() != persisted_revision {
                        // Snapshots are best effort; the next tick retries
                        match self.persist_parts(request, accumulator.parts()).await {
                            Ok(()) => {
                                persisted_revision = accumulator.revision();
                                snapshots += 1;
                            }
                            Err(e) => {
                                tracing::warn!("Turn {} snapshot failed: {}", handle.turn_id(), e);
                            }
                        }
                    }
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        if !streaming {
                            handle.set_status(ChatStatus::Streaming);
                            streaming = true;
                        }
                        accumulator.apply(&event);
                        match event {
                            StreamEvent::Finish { usage: reported } => {
                                usage = reported;
                                break;
                            }
                            StreamEvent::Error { error_text } => {
                                tracing::warn!("Turn {} failed: {}", handle.turn_id(), error_text);
                                status = TurnStatus::Failed;
                                error = Some(error_text);
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Turn {} stream error: {}", handle.turn_id(), e);
                        status = TurnStatus::Failed;
                        error = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
        }

        let parts = accumulator.finalize_all();
        self.persist_parts(request, parts.clone()).await?;

        let mut credits = 0;
        let mut reconciliation = None;
        if let Some(usage) = usage {
            self.store
                .set_token_counts(
                    &request.user_id,
                    &request.conversation_id,
                    &request.user_message_id,
                    usage.input_tokens,
                    usage.output_tokens,
                )
                .await?;
            if let Some(ledger) = &self.ledger {
                credits = ledger.calculator().calculate_credits(
                    &request.model,
                    usage.input_tokens,
                    usage.output_tokens,
                );
                reconciliation = Some(ledger.reconcile(&request.user_id, request.period_start).await?);
            }
        }

        tracing::debug!(
            "Turn {} finished: {:?}, {} parts, {} credits",
            handle.turn_id(),
            status,
            parts.len(),
            credits
        );

        Ok(TurnOutcome {
            status,
            parts,
            usage,
            credits,
            reconciliation,
            error,
            snapshots,
        })
    }

    async fn persist_parts(&self, request: &TurnRequest, parts: Vec<MessagePart>) -> Result<()> {
        self.store
            .update_parts(
                &request.user_id,
                &request.conversation_id,
                &request.assistant_message_id,
                parts,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMessageStore;
    use confab_billing::{
        CreditCalculator, CreditConfig, InMemoryPurchaseStore, PurchaseStore,
    };
    use confab_core::parse_line;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    const MODEL: &str = "google:gemini-2.5-flash-lite";

    struct Harness {
        driver: TurnDriver,
        store: Arc<InMemoryMessageStore>,
        purchases: Arc<InMemoryPurchaseStore>,
    }

    async fn harness(config: TurnConfig) -> Harness {
        let store = Arc::new(InMemoryMessageStore::new());
        let purchases = Arc::new(InMemoryPurchaseStore::new());
        let credit_config = CreditConfig {
            subscription_allowance: 0,
            ..CreditConfig::default()
        };
        let ledger = Arc::new(CreditLedger::new(
            &credit_config,
            CreditCalculator::from_config(&credit_config),
            store.clone(),
            purchases.clone(),
        ));
        ledger
            .purchase_pack("u1", Utc::now() - chrono::Duration::days(3))
            .await
            .unwrap();

        store
            .append(StoredMessage::new("u1", "c1", "user-1", Role::User, MODEL))
            .await
            .unwrap();

        let driver = TurnDriver::new(store.clone(), Arc::new(StreamingCoordinator::new()))
            .with_ledger(ledger)
            .with_config(config);
        Harness {
            driver,
            store,
            purchases,
        }
    }

    fn request(user_id: &str) -> TurnRequest {
        TurnRequest {
            user_id: user_id.to_string(),
            conversation_id: "c1".to_string(),
            user_message_id: "user-1".to_string(),
            assistant_message_id: "assistant-1".to_string(),
            model: MODEL.to_string(),
            period_start: Utc::now() - chrono::Duration::days(1),
        }
    }

    fn events(lines: &[&str]) -> Vec<confab_core::Result<StreamEvent>> {
        lines.iter().filter_map(|l| parse_line(l)).map(Ok).collect()
    }

    fn completed_stream() -> Vec<confab_core::Result<StreamEvent>> {
        events(&[
            r#"data: {"type":"reasoning-start","id":"0"}"#,
            r#"data: {"type":"reasoning-delta","id":"0","delta":"Considering"}"#,
            r#"data: {"type":"reasoning-end","id":"0"}"#,
            r#"data: {"type":"text-delta","delta":"Hello"}"#,
            r#"data: {"type":"text-delta","delta":" there"}"#,
            r#"data: {"type":"finish","usage":{"inputTokens":1000,"outputTokens":500}}"#,
        ])
    }

    async fn pack_remaining(h: &Harness) -> u64 {
        h.purchases.purchases("u1").await.unwrap()[0].credits_remaining
    }

    #[tokio::test]
    async fn test_completed_turn_persists_and_bills() {
        let h = harness(TurnConfig::default()).await;
        let outcome = h
            .driver
            .run(&request("u1"), futures::stream::iter(completed_stream()))
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.parts.len(), 2);
        assert_eq!(outcome.parts[1], MessagePart::text("Hello there"));
        assert_eq!(
            outcome.usage,
            Some(TokenUsage {
                input_tokens: 1000,
                output_tokens: 500
            })
        );
        assert_eq!(outcome.credits, 1);
        assert_eq!(outcome.reconciliation.unwrap().adjusted, 1);

        let assistant = h.store.get("c1", "assistant-1").await.unwrap().unwrap();
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.parts, outcome.parts);

        let user = h.store.get("c1", "user-1").await.unwrap().unwrap();
        assert_eq!(user.input_tokens, Some(1000));
        assert_eq!(user.output_tokens, Some(500));

        assert_eq!(pack_remaining(&h).await, confab_billing::config::DEFAULT_PACK_SIZE - 1);
        assert!(h.driver.coordinator().active_turns().is_empty());
        assert_eq!(h.driver.coordinator().streaming_target(), None);
    }

    #[tokio::test]
    async fn test_retried_turn_is_billed_once() {
        let h = harness(TurnConfig::default()).await;
        h.driver
            .run(&request("u1"), futures::stream::iter(completed_stream()))
            .await
            .unwrap();
        let retry = h
            .driver
            .run(&request("u1"), futures::stream::iter(completed_stream()))
            .await
            .unwrap();

        assert_eq!(retry.reconciliation.unwrap().adjusted, 0);
        assert_eq!(pack_remaining(&h).await, confab_billing::config::DEFAULT_PACK_SIZE - 1);
        assert_eq!(h.store.list("c1").await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_keeps_partial_parts() {
        let h = harness(TurnConfig {
            snapshot_interval: Duration::from_millis(10),
        })
        .await;
        let req = request("u1");
        let handle = h.driver.begin(&req);
        let (tx, rx) = mpsc::unbounded_channel();

        let producer = async {
            for event in events(&[
                r#"data: {"type":"text-delta","delta":"Partial"}"#,
                r#"data: {"type":"reasoning-delta","id":"1","delta":"cut off"}"#,
            ]) {
                tx.send(event).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;

            // A snapshot landed while the turn was still open
            let snapshot = h.store.get("c1", "assistant-1").await.unwrap().unwrap();
            assert_eq!(snapshot.parts, vec![MessagePart::text("Partial")]);
            assert_eq!(
                h.driver.coordinator().turn_status(&req.target()),
                ChatStatus::Streaming
            );

            handle.cancel();
        };

        let (outcome, ()) = tokio::join!(
            h.driver.drive(&req, &handle, UnboundedReceiverStream::new(rx)),
            producer
        );
        let outcome = outcome.unwrap();

        assert_eq!(outcome.status, TurnStatus::Aborted);
        assert!(outcome.snapshots >= 1);
        assert_eq!(
            outcome.parts,
            vec![
                MessagePart::text("Partial"),
                MessagePart::reasoning("reasoning-1", "cut off", None),
            ]
        );
        let stored = h.store.get("c1", "assistant-1").await.unwrap().unwrap();
        assert_eq!(stored.parts, outcome.parts);
        assert_eq!(outcome.usage, None);
        assert_eq!(pack_remaining(&h).await, confab_billing::config::DEFAULT_PACK_SIZE);
    }

    #[tokio::test]
    async fn test_provider_error_fails_turn_and_stays_visible() {
        let h = harness(TurnConfig::default()).await;
        let outcome = h
            .driver
            .run(
                &request("u1"),
                futures::stream::iter(events(&[
                    r#"data: {"type":"text-delta","delta":"Half"}"#,
                    r#"data: {"type":"error","errorText":"overloaded"}"#,
                    r#"data: {"type":"text-delta","delta":"never read"}"#,
                ])),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("overloaded"));
        assert_eq!(outcome.parts, vec![MessagePart::text("Half")]);
        let target = request("u1").target();
        assert_eq!(h.driver.coordinator().status_for(&target), ChatStatus::Error);
    }

    #[tokio::test]
    async fn test_transport_error_fails_turn() {
        let h = harness(TurnConfig::default()).await;
        let stream = futures::stream::iter(vec![
            parse_line(r#"data: {"type":"text-delta","delta":"a"}"#)
                .map(Ok)
                .unwrap(),
            Err(confab_core::Error::Stream("connection reset".into())),
        ]);
        let outcome = h.driver.run(&request("u1"), stream).await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Failed);
        assert!(outcome.error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_stream_end_without_finish_completes_unbilled() {
        let h = harness(TurnConfig::default()).await;
        let outcome = h
            .driver
            .run(
                &request("u1"),
                futures::stream::iter(events(&[r#"data: {"type":"text-delta","delta":"ok"}"#])),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.usage, None);
        assert!(outcome.reconciliation.is_none());
        let user = h.store.get("c1", "user-1").await.unwrap().unwrap();
        assert_eq!(user.input_tokens, None);
    }

    /// Store whose first `update_parts` fails
    struct FlakyStore {
        inner: InMemoryMessageStore,
        failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageStore for FlakyStore {
        async fn append(&self, message: StoredMessage) -> Result<crate::store::AppendOutcome> {
            self.inner.append(message).await
        }

        async fn update_parts(
            &self,
            user_id: &str,
            conversation_id: &str,
            message_id: &str,
            parts: Vec<MessagePart>,
        ) -> Result<()> {
            use std::sync::atomic::Ordering;
            if self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(crate::Error::NotFound("store unavailable".into()));
            }
            self.inner
                .update_parts(user_id, conversation_id, message_id, parts)
                .await
        }

        async fn set_token_counts(
            &self,
            user_id: &str,
            conversation_id: &str,
            message_id: &str,
            input_tokens: u64,
            output_tokens: u64,
        ) -> Result<()> {
            self.inner
                .set_token_counts(user_id, conversation_id, message_id, input_tokens, output_tokens)
                .await
        }

        async fn discard(
            &self,
            user_id: &str,
            conversation_id: &str,
            message_id: &str,
            at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.discard(user_id, conversation_id, message_id, at).await
        }

        async fn get(&self, conversation_id: &str, message_id: &str) -> Result<Option<StoredMessage>> {
            self.inner.get(conversation_id, message_id).await
        }

        async fn list(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
            self.inner.list(conversation_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_snapshot_does_not_end_turn() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryMessageStore::new(),
            failures: Default::default(),
        });
        store
            .append(StoredMessage::new("u1", "c1", "user-1", Role::User, MODEL))
            .await
            .unwrap();
        let driver = TurnDriver::new(store.clone(), Arc::new(StreamingCoordinator::new()))
            .with_config(TurnConfig {
                snapshot_interval: Duration::from_millis(10),
            });
        let req = request("u1");
        let handle = driver.begin(&req);
        let (tx, rx) = mpsc::unbounded_channel();

        let producer = async {
            for event in events(&[r#"data: {"type":"text-delta","delta":"partial answer"}"#]) {
                tx.send(event).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            for event in events(&[
                r#"data: {"type":"text-delta","delta":" more"}"#,
                r#"data: {"type":"finish","usage":{"inputTokens":10,"outputTokens":5}}"#,
            ]) {
                tx.send(event).unwrap();
            }
        };

        let (outcome, ()) = tokio::join!(
            driver.drive(&req, &handle, UnboundedReceiverStream::new(rx)),
            producer
        );
        let outcome = outcome.unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        // The failed tick was retried on the next one
        assert!(outcome.snapshots >= 1);
        assert!(store.failures.load(std::sync::atomic::Ordering::SeqCst) >= 3);

        let stored = store.get("c1", "assistant-1").await.unwrap().unwrap();
        assert_eq!(stored.parts, vec![MessagePart::text("partial answer more")]);
        let user = store.get("c1", "user-1").await.unwrap().unwrap();
        assert_eq!(user.input_tokens, Some(10));
    }

    #[tokio::test]
    async fn test_foreign_user_is_rejected() {
        let h = harness(TurnConfig::default()).await;
        let err = h
            .driver
            .run(&request("u2"), futures::stream::iter(completed_stream()))
            .await
            .unwrap_err();
        assert!(err.is_authorization());
        assert!(h.store.get("c1", "assistant-1").await.unwrap().is_none());
    }
}
