//! Which conversation is streaming, as far as the UI is concerned.
//!
//! Every in-flight turn gets its own [`TurnHandle`] (cancellation token plus
//! raw status), so background turns stay observable and cancellable. A
//! separate foreground pointer names the one conversation whose activity
//! the UI should reflect; the most recent send always takes it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// UI-facing streaming status of a conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    #[default]
    Ready,
    Submitted,
    Streaming,
    Error,
}

impl ChatStatus {
    /// Check if a request is in flight
    pub fn is_busy(&self) -> bool {
        matches!(self, ChatStatus::Submitted | ChatStatus::Streaming)
    }
}

/// A conversation, or the unsaved "new chat" that has no id yet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatTarget {
    Draft,
    Conversation(String),
}

impl ChatTarget {
    /// Map an optional conversation id; `None` is the draft
    pub fn from_id(id: Option<&str>) -> Self {
        match id {
            Some(id) => Self::Conversation(id.to_string()),
            None => Self::Draft,
        }
    }

    /// Get the conversation id, if any
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Draft => None,
            Self::Conversation(id) => Some(id),
        }
    }
}

impl From<&str> for ChatTarget {
    fn from(id: &str) -> Self {
        Self::Conversation(id.to_string())
    }
}

/// Status to show for `current` given the raw status and the foreground target.
///
/// A busy status that belongs to some other conversation reads as `Ready`
/// so a background turn never blocks input elsewhere. `Error` is never masked.
pub fn effective_status(
    raw: ChatStatus,
    current: &ChatTarget,
    streaming: Option<&ChatTarget>,
) -> ChatStatus {
    match streaming {
        Some(streaming) if streaming != current && raw.is_busy() => ChatStatus::Ready,
        _ => raw,
    }
}

/// A cloneable handle on one in-flight turn.
///
/// All fields are `Arc`-backed, so cloning is cheap.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    turn_id: Uuid,
    target: ChatTarget,
    cancel: CancellationToken,
    status: Arc<Mutex<ChatStatus>>,
}

impl TurnHandle {
    fn new(target: ChatTarget, status: ChatStatus) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            target,
            cancel: CancellationToken::new(),
            status: Arc::new(Mutex::new(status)),
        }
    }

    /// Unique id of this turn
    pub fn turn_id(&self) -> Uuid {
        self.turn_id
    }

    /// The conversation this turn belongs to
    pub fn target(&self) -> &ChatTarget {
        &self.target
    }

    /// Abort the turn
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the turn was aborted
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get the cancellation token
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Raw status of this turn
    pub fn status(&self) -> ChatStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: ChatStatus) {
        *self.status.lock() = status;
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    foreground: Option<ChatTarget>,
    turns: HashMap<ChatTarget, TurnHandle>,
}

/// Tracks streaming turns for one user session
#[derive(Debug, Default)]
pub struct StreamingCoordinator {
    state: Mutex<CoordinatorState>,
}

impl StreamingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request for `target` was submitted. `target` takes the foreground.
    pub fn start_sending(&self, target: ChatTarget) -> TurnHandle {
        let mut state = self.state.lock();
        Self::take_foreground(&mut state, &target);
        let handle = TurnHandle::new(target.clone(), ChatStatus::Submitted);
        if let Some(previous) = state.turns.insert(target, handle.clone()) {
            tracing::debug!("Turn {} replaced by {}", previous.turn_id, handle.turn_id);
        }
        handle
    }

    /// The response for `target` began streaming. `target` takes the foreground.
    pub fn start_streaming(&self, target: ChatTarget) -> TurnHandle {
        let mut state = self.state.lock();
        Self::take_foreground(&mut state, &target);
        if let Some(handle) = state.turns.get(&target).cloned() {
            handle.set_status(ChatStatus::Streaming);
            return handle;
        }
        let handle = TurnHandle::new(target.clone(), ChatStatus::Streaming);
        state.turns.insert(target, handle.clone());
        handle
    }

    /// The turn for `target` finished. Clears the foreground only if it
    /// still points at `target`, so a stale completion cannot clear a newer
    /// conversation's slot.
    pub fn complete_streaming(&self, target: &ChatTarget) {
        let mut state = self.state.lock();
        if let Some(handle) = state.turns.remove(target) {
            handle.set_status(ChatStatus::Ready);
        }
        if state.foreground.as_ref() == Some(target) {
            state.foreground = None;
        }
    }

    /// Like [`complete_streaming`](Self::complete_streaming), but does nothing
    /// if `handle` has been superseded by a newer turn on the same target.
    ///
    /// A turn that ended in `Error` stays registered so its status remains
    /// visible until the next send on that target.
    pub fn finish_turn(&self, handle: &TurnHandle) {
        let mut state = self.state.lock();
        let is_current = state
            .turns
            .get(&handle.target)
            .is_some_and(|h| h.turn_id == handle.turn_id);
        if !is_current {
            return;
        }
        if handle.status() != ChatStatus::Error {
            state.turns.remove(&handle.target);
            handle.set_status(ChatStatus::Ready);
        }
        if state.foreground.as_ref() == Some(&handle.target) {
            state.foreground = None;
        }
    }

    /// The conversation currently holding the foreground
    pub fn streaming_target(&self) -> Option<ChatTarget> {
        self.state.lock().foreground.clone()
    }

    /// Raw status of the turn for `target`, `Ready` if there is none
    pub fn turn_status(&self, target: &ChatTarget) -> ChatStatus {
        self.state
            .lock()
            .turns
            .get(target)
            .map(TurnHandle::status)
            .unwrap_or_default()
    }

    /// Status the UI should show while `current` is open
    pub fn status_for(&self, current: &ChatTarget) -> ChatStatus {
        let state = self.state.lock();
        let raw = state
            .turns
            .get(current)
            .map(TurnHandle::status)
            .unwrap_or_default();
        effective_status(raw, current, state.foreground.as_ref())
    }

    /// Abort the turn for `target`. Returns `false` if none is running.
    pub fn cancel(&self, target: &ChatTarget) -> bool {
        match self.state.lock().turns.get(target) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Targets with a registered turn, foreground or not
    pub fn active_turns(&self) -> Vec<ChatTarget> {
        self.state.lock().turns.keys().cloned().collect()
    }

    fn take_foreground(state: &mut CoordinatorState, target: &ChatTarget) {
        if let Some(previous) = state.foreground.as_ref() {
            if previous != target {
                tracing::debug!("Foreground moved from {:?} to {:?}", previous, target);
            }
        }
        state.foreground = Some(target.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(id: &str) -> ChatTarget {
        ChatTarget::from(id)
    }

    #[test]
    fn test_background_streaming_reads_ready() {
        assert_eq!(
            effective_status(ChatStatus::Streaming, &conv("conv-B"), Some(&conv("conv-A"))),
            ChatStatus::Ready
        );
        assert_eq!(
            effective_status(ChatStatus::Submitted, &conv("conv-B"), Some(&conv("conv-A"))),
            ChatStatus::Ready
        );
    }

    #[test]
    fn test_foreground_streaming_is_visible() {
        assert_eq!(
            effective_status(ChatStatus::Streaming, &conv("conv-A"), Some(&conv("conv-A"))),
            ChatStatus::Streaming
        );
    }

    #[test]
    fn test_error_is_never_masked() {
        let targets = [ChatTarget::Draft, conv("conv-A"), conv("conv-B")];
        for current in &targets {
            for streaming in targets.iter().map(Some).chain([None]) {
                assert_eq!(
                    effective_status(ChatStatus::Error, current, streaming),
                    ChatStatus::Error
                );
            }
        }
    }

    #[test]
    fn test_no_tracked_conversation_passes_raw_through() {
        assert_eq!(
            effective_status(ChatStatus::Streaming, &conv("conv-A"), None),
            ChatStatus::Streaming
        );
    }

    #[test]
    fn test_drafts_compare_equal() {
        assert_eq!(ChatTarget::from_id(None), ChatTarget::Draft);
        assert_eq!(
            effective_status(ChatStatus::Submitted, &ChatTarget::Draft, Some(&ChatTarget::Draft)),
            ChatStatus::Submitted
        );
        assert_eq!(
            effective_status(ChatStatus::Submitted, &ChatTarget::Draft, Some(&conv("conv-A"))),
            ChatStatus::Ready
        );
    }

    #[test]
    fn test_most_recent_send_wins_foreground() {
        let coordinator = StreamingCoordinator::new();
        coordinator.start_streaming(conv("conv-A"));
        coordinator.start_sending(conv("conv-B"));

        assert_eq!(coordinator.streaming_target(), Some(conv("conv-B")));
        // A is still running, just no longer foreground
        assert_eq!(coordinator.turn_status(&conv("conv-A")), ChatStatus::Streaming);
        assert_eq!(coordinator.status_for(&conv("conv-A")), ChatStatus::Ready);
        assert_eq!(coordinator.status_for(&conv("conv-B")), ChatStatus::Submitted);
    }

    #[test]
    fn test_stale_completion_keeps_newer_foreground() {
        let coordinator = StreamingCoordinator::new();
        coordinator.start_streaming(conv("conv-A"));
        coordinator.start_streaming(conv("conv-B"));

        coordinator.complete_streaming(&conv("conv-A"));
        assert_eq!(coordinator.streaming_target(), Some(conv("conv-B")));
        assert_eq!(coordinator.turn_status(&conv("conv-A")), ChatStatus::Ready);

        coordinator.complete_streaming(&conv("conv-B"));
        assert_eq!(coordinator.streaming_target(), None);
    }

    #[test]
    fn test_start_streaming_promotes_submitted_turn() {
        let coordinator = StreamingCoordinator::new();
        let sent = coordinator.start_sending(conv("conv-A"));
        let streaming = coordinator.start_streaming(conv("conv-A"));
        assert_eq!(sent.turn_id(), streaming.turn_id());
        assert_eq!(sent.status(), ChatStatus::Streaming);
    }

    #[test]
    fn test_finish_superseded_turn_is_ignored() {
        let coordinator = StreamingCoordinator::new();
        let old = coordinator.start_sending(conv("conv-A"));
        let new = coordinator.start_sending(conv("conv-A"));

        coordinator.finish_turn(&old);
        assert_eq!(coordinator.streaming_target(), Some(conv("conv-A")));
        assert_eq!(coordinator.turn_status(&conv("conv-A")), ChatStatus::Submitted);

        coordinator.finish_turn(&new);
        assert_eq!(coordinator.streaming_target(), None);
        assert!(coordinator.active_turns().is_empty());
    }

    #[test]
    fn test_failed_turn_stays_visible() {
        let coordinator = StreamingCoordinator::new();
        let handle = coordinator.start_sending(conv("conv-A"));
        handle.set_status(ChatStatus::Error);
        coordinator.finish_turn(&handle);

        assert_eq!(coordinator.streaming_target(), None);
        assert_eq!(coordinator.status_for(&conv("conv-A")), ChatStatus::Error);

        coordinator.start_sending(conv("conv-A"));
        assert_eq!(coordinator.status_for(&conv("conv-A")), ChatStatus::Submitted);
    }

    #[test]
    fn test_cancel_background_turn() {
        let coordinator = StreamingCoordinator::new();
        let a = coordinator.start_sending(conv("conv-A"));
        coordinator.start_sending(conv("conv-B"));

        assert!(coordinator.cancel(&conv("conv-A")));
        assert!(a.is_cancelled());
        assert!(!coordinator.cancel(&conv("conv-C")));
    }
}
