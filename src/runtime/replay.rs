//! Seam between the instance driver and the turn function.
use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Event, OrchestrationContext, TurnResult, run_turn_with};

/// Outcome of one replayed turn: updated history, new actions, and the
/// orchestration's result once it has finished.
pub type ReplayedTurn = TurnResult<Result<String, String>>;

pub trait ReplayEngine: Send + Sync {
    /// Replays one turn of `handler` against `history`, of which the first
    /// `seen_len` events were already acted on by an earlier turn. The error
    /// side is a nondeterminism report.
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        seen_len: usize,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> Result<ReplayedTurn, String>;
}

/// Polls the handler in place with `run_turn_with`.
pub struct InlineReplay;

impl ReplayEngine for InlineReplay {
    fn replay(
        &self,
        instance: &str,
        history: Vec<Event>,
        seen_len: usize,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> Result<ReplayedTurn, String> {
        run_turn_with(instance, history, seen_len, turn_index, move |ctx: OrchestrationContext| async move {
            handler.invoke(ctx, input).await
        })
    }
}
