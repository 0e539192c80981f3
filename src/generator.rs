//! # Generator Boundary
//!
//! The pipeline's view of the language model: a prompt goes in, raw text or
//! an error comes out. Nothing here retries. Pacing of outbound calls is
//! delegated to a [`SlotGate`].
//!
//! - [`Generator`]: the model call itself
//! - [`SlotGate`]: acquire / release / backoff around each call
//! - [`ScriptedGenerator`]: canned replies for tests and dry runs

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

// ─── Reply ────────────────────────────────────────────────────────────────────

/// What a generator call produced. Either field may be set; an absent
/// `raw_text` with no `error` is an empty reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorReply {
    /// Model output.
    pub raw_text: Option<String>,
    /// Transport or model error.
    pub error: Option<String>,
}

impl GeneratorReply {
    /// A successful reply.
    pub fn text(raw: impl Into<String>) -> Self {
        Self {
            raw_text: Some(raw.into()),
            error: None,
        }
    }

    /// A failed call.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            raw_text: None,
            error: Some(error.into()),
        }
    }
}

// ─── Traits ───────────────────────────────────────────────────────────────────

/// A language model, or anything standing in for one.
///
/// Object-safe so it can be held as `Arc<dyn Generator>`.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Send `prompt` and return whatever came back.
    async fn generate(&self, prompt: &str) -> GeneratorReply;
}

/// Gate around outbound generator calls.
#[async_trait]
pub trait SlotGate: Send + Sync {
    /// Wait for a free slot.
    async fn acquire(&self);

    /// Return a slot taken by [`acquire`](Self::acquire).
    fn release(&self);

    /// The last call failed upstream; slow down.
    fn backoff(&self, reason: &str);
}

// ─── Gates ────────────────────────────────────────────────────────────────────

/// Gate that never waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl SlotGate for Unlimited {
    async fn acquire(&self) {}

    fn release(&self) {}

    fn backoff(&self, _reason: &str) {}
}

/// Bounded concurrency with a doubling pause after upstream failures.
///
/// A successful release resets the pause.
#[derive(Debug)]
pub struct ConcurrencyGate {
    slots: Arc<Semaphore>,
    base_backoff: Duration,
    max_backoff: Duration,
    state: Mutex<BackoffState>,
}

#[derive(Debug, Default)]
struct BackoffState {
    current: Option<Duration>,
    paused_until: Option<Instant>,
}

impl ConcurrencyGate {
    /// Gate allowing `max_in_flight` concurrent calls (at least one).
    pub fn new(max_in_flight: usize, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_in_flight.max(1))),
            base_backoff,
            max_backoff: max_backoff.max(base_backoff),
            state: Mutex::new(BackoffState::default()),
        }
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Length of the current pause, if backing off.
    pub fn current_backoff(&self) -> Option<Duration> {
        self.state.lock().current
    }
}

#[async_trait]
impl SlotGate for ConcurrencyGate {
    async fn acquire(&self) {
        let pause = {
            let state = self.state.lock();
            state
                .paused_until
                .map(|until| until.saturating_duration_since(Instant::now()))
        };
        if let Some(pause) = pause.filter(|p| !p.is_zero()) {
            debug!(pause_ms = pause.as_millis() as u64, "generator gate backing off");
            tokio::time::sleep(pause).await;
        }
        // The semaphore is never closed, so acquisition only fails if it is.
        if let Ok(permit) = self.slots.acquire().await {
            permit.forget();
        }
    }

    fn release(&self) {
        self.slots.add_permits(1);
        let mut state = self.state.lock();
        if state.paused_until.map_or(true, |until| Instant::now() >= until) {
            state.current = None;
            state.paused_until = None;
        }
    }

    fn backoff(&self, reason: &str) {
        let mut state = self.state.lock();
        let next = match state.current {
            None => self.base_backoff,
            Some(d) => (d * 2).min(self.max_backoff),
        };
        state.current = Some(next);
        state.paused_until = Some(Instant::now() + next);
        warn!(reason, backoff_ms = next.as_millis() as u64, "generator backoff");
    }
}

// ─── Scripted generator ───────────────────────────────────────────────────────

/// Replays queued replies in order and records every prompt it was sent.
/// Once the queue is empty every call fails.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<GeneratorReply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    /// Generator that will return `replies` in order.
    pub fn new(replies: impl IntoIterator<Item = GeneratorReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> GeneratorReply {
        self.prompts.lock().push(prompt.to_string());
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| GeneratorReply::failed("script exhausted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_generator_replays_in_order() {
        let g = ScriptedGenerator::new([GeneratorReply::text("one"), GeneratorReply::failed("boom")]);
        assert_eq!(g.generate("p1").await.raw_text.as_deref(), Some("one"));
        assert_eq!(g.generate("p2").await.error.as_deref(), Some("boom"));
        assert_eq!(g.generate("p3").await.error.as_deref(), Some("script exhausted"));
        assert_eq!(g.prompts(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_concurrency_gate_counts_slots() {
        let gate = ConcurrencyGate::new(2, Duration::from_millis(1), Duration::from_millis(4));
        gate.acquire().await;
        gate.acquire().await;
        assert_eq!(gate.available(), 0);
        gate.release();
        assert_eq!(gate.available(), 1);
        gate.release();
        assert_eq!(gate.available(), 2);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let gate = ConcurrencyGate::new(1, Duration::from_millis(10), Duration::from_millis(25));
        gate.backoff("rate limited");
        assert_eq!(gate.current_backoff(), Some(Duration::from_millis(10)));
        gate.backoff("rate limited");
        assert_eq!(gate.current_backoff(), Some(Duration::from_millis(20)));
        gate.backoff("rate limited");
        assert_eq!(gate.current_backoff(), Some(Duration::from_millis(25)));
    }

    #[tokio::test]
    async fn test_acquire_waits_out_backoff() {
        let gate = ConcurrencyGate::new(1, Duration::from_millis(30), Duration::from_millis(30));
        gate.backoff("upstream 429");
        let start = Instant::now();
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(25));
        gate.release();
        assert_eq!(gate.current_backoff(), None);
    }
}
