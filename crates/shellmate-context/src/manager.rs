//! Window manager: keeps a conversation under an input-token budget

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conversation::{Conversation, Turn};
use crate::error::{ContextError, ContextResult};
use crate::tokens::TokenEstimator;

/// Unit of eviction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionGranularity {
    /// Remove one turn at a time
    #[default]
    Turn,
    /// Remove a user turn together with the reply that follows it
    Pair,
}

impl EvictionGranularity {
    fn step(self) -> usize {
        match self {
            EvictionGranularity::Turn => 1,
            EvictionGranularity::Pair => 2,
        }
    }
}

/// What to do when the budget cannot be met without touching pinned turns
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustionPolicy {
    /// Leave the conversation untouched and return `EvictionExhausted`
    #[default]
    FailFast,
    /// Keep whatever trimming was possible and report the overrun
    BestEffort,
}

/// Terminal state of a fit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitState {
    WithinBudget,
    ExhaustedEvictable,
}

/// Outcome of [`WindowManager::check_reduce_context`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowFit {
    /// Estimated tokens of the conversation as it now stands
    pub tokens: usize,
    /// Turns removed by this pass, oldest first
    pub evicted: Vec<Turn>,
    pub state: FitState,
}

impl WindowFit {
    pub fn is_within_budget(&self) -> bool {
        self.state == FitState::WithinBudget
    }
}

/// Trims the live region of a conversation oldest-first.
///
/// Turns before the eviction index are never removed, and the newest turn
/// (normally the request being sent) always survives.
#[derive(Debug, Clone)]
pub struct WindowManager {
    estimator: TokenEstimator,
    granularity: EvictionGranularity,
    policy: ExhaustionPolicy,
}

impl WindowManager {
    pub fn new(estimator: TokenEstimator) -> Self {
        Self {
            estimator,
            granularity: EvictionGranularity::default(),
            policy: ExhaustionPolicy::default(),
        }
    }

    pub fn with_granularity(mut self, granularity: EvictionGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    pub fn policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    /// Measure `conversation` and evict turns starting at `eviction_index`
    /// until it fits in `token_limit`.
    ///
    /// Every step removes the turn currently at `eviction_index`, so the
    /// pass walks forward through the live region in FIFO order. The returned
    /// token count is re-measured from scratch.
    pub fn check_reduce_context(
        &self,
        conversation: &mut Conversation,
        token_limit: usize,
        model: &str,
        eviction_index: usize,
    ) -> ContextResult<WindowFit> {
        if eviction_index == 0 {
            return Err(ContextError::InvalidEvictionIndex);
        }

        let measured = self.estimator.estimate(conversation.turns(), model)?;
        debug!(tokens = measured, limit = token_limit, turns = conversation.len(), "measured conversation");
        if measured <= token_limit {
            return Ok(WindowFit {
                tokens: measured,
                evicted: Vec::new(),
                state: FitState::WithinBudget,
            });
        }

        let mut working = conversation.clone();
        let mut running = measured;
        let mut evicted = Vec::new();
        let step = self.granularity.step();

        while running > token_limit && working.len().saturating_sub(eviction_index) > step {
            for _ in 0..step {
                let turn = working.remove(eviction_index)?;
                running = running.saturating_sub(self.estimator.turn_cost(&turn, model)?);
                evicted.push(turn);
            }
            debug!(tokens = running, limit = token_limit, "evicted oldest live turn");
        }

        let tokens = self.estimator.estimate(working.turns(), model)?;
        let state = if tokens <= token_limit {
            FitState::WithinBudget
        } else {
            FitState::ExhaustedEvictable
        };

        if state == FitState::ExhaustedEvictable {
            warn!(
                tokens,
                limit = token_limit,
                evicted = evicted.len(),
                "no evictable turns left, conversation still over budget"
            );
            if self.policy == ExhaustionPolicy::FailFast {
                return Err(ContextError::EvictionExhausted {
                    tokens,
                    limit: token_limit,
                });
            }
        }

        *conversation = working;
        Ok(WindowFit {
            tokens,
            evicted,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::conversation::Role;
    use crate::tokens::{MessageOverhead, ModelFamily, ModelTable, TokenEncoder, TokenizerProvider};

    const MODEL: &str = "synthetic";

    struct WordEncoder;

    impl TokenEncoder for WordEncoder {
        fn encode(&self, text: &str) -> Vec<u32> {
            text.split_whitespace().map(|_| 0).collect()
        }
    }

    struct WordProvider;

    impl TokenizerProvider for WordProvider {
        fn encoder_for(&self, _model: &str) -> ContextResult<Arc<dyn TokenEncoder>> {
            Ok(Arc::new(WordEncoder))
        }
    }

    fn estimator() -> TokenEstimator {
        let table = ModelTable::new(vec![
            ModelFamily::new(MODEL, MODEL).snapshot(MODEL, MessageOverhead::new(0, 0))
        ]);
        TokenEstimator::new(table, Arc::new(WordProvider))
    }

    fn manager() -> WindowManager {
        WindowManager::new(estimator())
    }

    /// A turn whose cost is exactly `cost` tokens (one for the role word).
    fn turn(role: Role, cost: usize) -> Turn {
        Turn::new(role, vec!["w"; cost - 1].join(" "))
    }

    fn scenario() -> Conversation {
        Conversation::from_turns([
            turn(Role::System, 10),
            turn(Role::User, 20),
            turn(Role::Assistant, 20),
            turn(Role::User, 500),
        ])
    }

    #[test]
    fn within_budget_is_left_alone() {
        let mut conversation = Conversation::from_turns([turn(Role::System, 10), turn(Role::User, 5)]);
        let before = conversation.clone();

        let fit = manager()
            .check_reduce_context(&mut conversation, 100, MODEL, 1)
            .unwrap();

        assert_eq!(fit.tokens, 18);
        assert!(fit.is_within_budget());
        assert!(fit.evicted.is_empty());
        assert_eq!(conversation, before);
    }

    #[test]
    fn evicts_oldest_live_turn_first_until_it_fits() {
        let mut conversation = Conversation::from_turns([
            turn(Role::System, 10),
            turn(Role::User, 20),
            turn(Role::Assistant, 20),
            turn(Role::User, 5),
        ]);
        let original = conversation.clone();

        let fit = manager()
            .check_reduce_context(&mut conversation, 40, MODEL, 1)
            .unwrap();

        assert_eq!(fit.tokens, 38);
        assert_eq!(fit.state, FitState::WithinBudget);
        assert_eq!(fit.evicted, vec![original.turns()[1].clone()]);
        let expected = [&original.turns()[..1], &original.turns()[2..]].concat();
        assert_eq!(conversation.turns(), &expected[..]);
    }

    #[test]
    fn oversized_request_exhausts_and_fails_fast_without_changes() {
        let mut conversation = scenario();
        let before = conversation.clone();

        let err = manager()
            .check_reduce_context(&mut conversation, 40, MODEL, 1)
            .unwrap_err();

        assert_eq!(err, ContextError::EvictionExhausted { tokens: 513, limit: 40 });
        assert_eq!(conversation, before);
    }

    #[test]
    fn best_effort_keeps_pinned_system_turn_and_newest_request() {
        let mut conversation = scenario();
        let original = conversation.clone();

        let fit = manager()
            .with_policy(ExhaustionPolicy::BestEffort)
            .check_reduce_context(&mut conversation, 40, MODEL, 1)
            .unwrap();

        assert_eq!(fit.state, FitState::ExhaustedEvictable);
        assert_eq!(fit.tokens, 513);
        assert_eq!(fit.evicted, original.turns()[1..3].to_vec());
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.get(0), original.get(0));
        assert_eq!(conversation.get(1), original.get(3));
    }

    #[test]
    fn only_pinned_prefix_over_budget_is_exhausted() {
        let mut conversation = Conversation::from_turns([
            turn(Role::System, 30),
            turn(Role::User, 30),
            turn(Role::Assistant, 30),
        ]);
        let before = conversation.clone();

        let err = manager()
            .check_reduce_context(&mut conversation, 40, MODEL, 3)
            .unwrap_err();

        assert!(matches!(err, ContextError::EvictionExhausted { tokens: 93, limit: 40 }));
        assert_eq!(conversation, before);
    }

    #[test]
    fn eviction_index_zero_is_rejected() {
        let mut conversation = scenario();

        let err = manager()
            .check_reduce_context(&mut conversation, 40, MODEL, 0)
            .unwrap_err();

        assert_eq!(err, ContextError::InvalidEvictionIndex);
    }

    #[test]
    fn unsupported_model_propagates() {
        let mut conversation = scenario();

        let err = manager()
            .check_reduce_context(&mut conversation, 40, "made-up-model", 1)
            .unwrap_err();

        assert_eq!(err, ContextError::UnsupportedModel("made-up-model".to_string()));
    }

    #[test]
    fn pair_granularity_removes_exchanges_together() {
        let mut conversation = Conversation::from_turns([
            turn(Role::System, 5),
            turn(Role::User, 10),
            turn(Role::Assistant, 10),
            turn(Role::User, 10),
            turn(Role::Assistant, 10),
            turn(Role::User, 5),
        ]);
        let original = conversation.clone();

        let fit = manager()
            .with_granularity(EvictionGranularity::Pair)
            .check_reduce_context(&mut conversation, 40, MODEL, 1)
            .unwrap();

        assert_eq!(fit.tokens, 33);
        assert_eq!(fit.evicted, original.turns()[1..3].to_vec());
        let expected = [&original.turns()[..1], &original.turns()[3..]].concat();
        assert_eq!(conversation.turns(), &expected[..]);
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let mut conversation = scenario();
        let manager = manager().with_policy(ExhaustionPolicy::BestEffort);

        let first = manager
            .check_reduce_context(&mut conversation, 40, MODEL, 1)
            .unwrap();
        let after_first = conversation.clone();
        let second = manager
            .check_reduce_context(&mut conversation, 40, MODEL, 1)
            .unwrap();

        assert_eq!(first.tokens, second.tokens);
        assert!(second.evicted.is_empty());
        assert_eq!(conversation, after_first);
    }

    fn arb_costs() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(2usize..60, 1..14)
    }

    fn build(costs: &[usize]) -> Conversation {
        costs
            .iter()
            .enumerate()
            .map(|(i, cost)| {
                let role = match i {
                    0 => Role::System,
                    i if i % 2 == 1 => Role::User,
                    _ => Role::Assistant,
                };
                turn(role, *cost)
            })
            .collect()
    }

    proptest! {
        #[test]
        fn pinned_prefix_and_fifo_order_hold(
            costs in arb_costs(),
            limit in 0usize..400,
            index in 1usize..5,
            pairs in any::<bool>(),
        ) {
            let granularity = if pairs { EvictionGranularity::Pair } else { EvictionGranularity::Turn };
            let manager = manager()
                .with_granularity(granularity)
                .with_policy(ExhaustionPolicy::BestEffort);
            let original = build(&costs);
            let mut conversation = original.clone();

            let fit = manager.check_reduce_context(&mut conversation, limit, MODEL, index).unwrap();

            let pinned = index.min(original.len());
            prop_assert_eq!(&conversation.turns()[..pinned], &original.turns()[..pinned]);

            // survivors of the live region are a suffix of the original live region
            let removed = original.len() - conversation.len();
            prop_assert_eq!(removed, fit.evicted.len());
            prop_assert_eq!(&conversation.turns()[pinned..], &original.turns()[pinned + removed..]);
            prop_assert_eq!(&fit.evicted[..], &original.turns()[pinned..pinned + removed]);

            if fit.state == FitState::WithinBudget {
                prop_assert!(fit.tokens <= limit);
            }
            prop_assert_eq!(fit.tokens, estimator().estimate(conversation.turns(), MODEL).unwrap());
        }

        #[test]
        fn fits_whenever_prefix_and_newest_turn_fit(
            costs in arb_costs(),
            index in 1usize..4,
        ) {
            let original = build(&costs);
            prop_assume!(original.len() > index);
            let estimator = estimator();
            let floor_turns: Vec<Turn> = original.turns()[..index]
                .iter()
                .chain(original.last())
                .cloned()
                .collect();
            let limit = estimator.estimate(&floor_turns, MODEL).unwrap();
            let mut conversation = original;

            let fit = manager().check_reduce_context(&mut conversation, limit, MODEL, index).unwrap();

            prop_assert!(fit.tokens <= limit);
        }

        #[test]
        fn fit_check_is_idempotent(
            costs in arb_costs(),
            limit in 0usize..400,
            index in 1usize..5,
        ) {
            let manager = manager().with_policy(ExhaustionPolicy::BestEffort);
            let mut conversation = build(&costs);

            let first = manager.check_reduce_context(&mut conversation, limit, MODEL, index).unwrap();
            let snapshot = conversation.clone();
            let second = manager.check_reduce_context(&mut conversation, limit, MODEL, index).unwrap();

            prop_assert_eq!(first.tokens, second.tokens);
            prop_assert_eq!(first.state, second.state);
            prop_assert!(second.evicted.is_empty());
            prop_assert_eq!(conversation, snapshot);
        }
    }
}
