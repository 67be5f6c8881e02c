//! Session token budget tracking
//!
//! The budget is a best-effort view. Authoritative `token_usage` events from
//! the service replace it wholesale; until one arrives, the budget is
//! estimated locally from the transcript. Per-message estimates are cached
//! against the shared message they were computed from, so a refresh during
//! streaming only re-estimates the message that changed.

use super::token_estimator::TokenEstimator;
use crate::message::Message;
use crate::metrics::METRICS;
use crate::stream::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Where the current budget figures came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetSource {
    #[default]
    Estimated,
    Reported,
}

/// Token budget snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub used: usize,
    pub total: usize,
    pub remaining: usize,
    pub source: BudgetSource,
}

impl TokenBudget {
    /// Budget derived from a local estimate
    pub fn estimated(used: usize, total: usize) -> Self {
        Self {
            used,
            total,
            remaining: total.saturating_sub(used),
            source: BudgetSource::Estimated,
        }
    }

    /// Budget reported by the service, taken as-is
    pub fn reported(usage: &TokenUsage) -> Self {
        Self {
            used: usage.used,
            total: usage.total,
            remaining: usage.remaining,
            source: BudgetSource::Reported,
        }
    }

    /// Percentage of the window in use (0.0-100.0)
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.used as f64 / self.total as f64) * 100.0
    }

    /// Check if the window is used up
    pub fn is_exhausted(&self) -> bool {
        self.total > 0 && self.remaining == 0
    }

    pub fn is_authoritative(&self) -> bool {
        self.source == BudgetSource::Reported
    }
}

/// Keeps the session's budget current
pub struct TokenBudgetTracker {
    estimator: Arc<dyn TokenEstimator>,
    context_window: usize,
    current: TokenBudget,
    estimates: HashMap<String, (Arc<Message>, usize)>,
}

impl TokenBudgetTracker {
    /// Create a tracker with an empty estimated budget
    pub fn new(estimator: Arc<dyn TokenEstimator>, context_window: usize) -> Self {
        Self {
            estimator,
            context_window,
            current: TokenBudget::estimated(0, context_window),
            estimates: HashMap::new(),
        }
    }

    /// Get the current budget
    pub fn current(&self) -> &TokenBudget {
        &self.current
    }

    /// Get the estimator
    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    /// Replace the budget with service-reported figures
    pub fn apply_reported(&mut self, usage: &TokenUsage) {
        debug!(
            "Authoritative token usage: used={}, total={}, remaining={}",
            usage.used, usage.total, usage.remaining
        );
        self.current = TokenBudget::reported(usage);
    }

    /// Re-estimate from the transcript unless an authoritative figure is in force
    pub fn refresh_estimate(&mut self, messages: &[Arc<Message>]) -> &TokenBudget {
        if self.current.is_authoritative() {
            return &self.current;
        }

        let mut used = 0;
        for message in messages {
            let tokens = match self.estimates.get_mut(&message.id) {
                Some((cached, tokens)) if Arc::ptr_eq(cached, message) => *tokens,
                Some(entry) => {
                    let tokens = self.estimator.estimate_message(message);
                    *entry = (Arc::clone(message), tokens);
                    tokens
                }
                None => {
                    let tokens = self.estimator.estimate_message(message);
                    self.estimates
                        .insert(message.id.clone(), (Arc::clone(message), tokens));
                    tokens
                }
            };
            used += tokens;
        }
        if self.estimates.len() > messages.len() {
            let live: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            self.estimates.retain(|id, _| live.contains(id.as_str()));
        }

        METRICS.record_estimate(used);
        self.current = TokenBudget::estimated(used, self.context_window);
        &self.current
    }

    /// Drop any authoritative figure and start over from zero
    pub fn reset(&mut self) {
        self.current = TokenBudget::estimated(0, self.context_window);
        self.estimates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ScriptAwareEstimator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker() -> TokenBudgetTracker {
        TokenBudgetTracker::new(Arc::new(ScriptAwareEstimator::default()), 4000)
    }

    fn shared(messages: Vec<Message>) -> Vec<Arc<Message>> {
        messages.into_iter().map(Arc::new).collect()
    }

    /// One token per character, counting characters seen
    #[derive(Default)]
    struct CountingEstimator {
        chars_seen: AtomicUsize,
    }

    impl TokenEstimator for CountingEstimator {
        fn estimate(&self, text: &str) -> usize {
            let chars = text.chars().count();
            self.chars_seen.fetch_add(chars, Ordering::SeqCst);
            chars
        }
    }

    #[test]
    fn test_estimate_fills_budget() {
        let mut tracker = tracker();
        let messages = shared(vec![Message::human("abcdefgh"), Message::assistant("m1", "abcd")]);
        let budget = tracker.refresh_estimate(&messages).clone();
        assert_eq!(budget.used, 3);
        assert_eq!(budget.total, 4000);
        assert_eq!(budget.remaining, 3997);
        assert_eq!(budget.source, BudgetSource::Estimated);
    }

    #[test]
    fn test_reported_usage_wins_over_estimate() {
        let mut tracker = tracker();
        let long = "x".repeat(3200); // estimates to 800
        tracker.refresh_estimate(&shared(vec![Message::human(long.clone())]));
        assert_eq!(tracker.current().used, 800);

        tracker.apply_reported(&TokenUsage {
            used: 1000,
            total: 4000,
            remaining: 3000,
            percentage: Some(25.0),
        });
        tracker.refresh_estimate(&shared(vec![Message::human(long)]));

        let budget = tracker.current();
        assert_eq!((budget.used, budget.total, budget.remaining), (1000, 4000, 3000));
        assert!(budget.is_authoritative());
    }

    #[test]
    fn test_refresh_only_estimates_changed_messages() {
        let estimator = Arc::new(CountingEstimator::default());
        let mut tracker = TokenBudgetTracker::new(estimator.clone(), 4000);

        let history = Arc::new(Message::assistant("a1", "x".repeat(1000)));
        let mut streaming = Arc::new(Message::assistant("m1", "ab"));
        tracker.refresh_estimate(&[history.clone(), streaming.clone()]);
        assert_eq!(tracker.current().used, 1002);
        assert_eq!(estimator.chars_seen.load(Ordering::SeqCst), 1002);

        Arc::make_mut(&mut streaming).content.push_str("cd");
        tracker.refresh_estimate(&[history.clone(), streaming.clone()]);
        assert_eq!(tracker.current().used, 1004);
        assert_eq!(estimator.chars_seen.load(Ordering::SeqCst), 1006);

        // dropped messages leave the total
        tracker.refresh_estimate(&[streaming]);
        assert_eq!(tracker.current().used, 4);
        assert_eq!(estimator.chars_seen.load(Ordering::SeqCst), 1006);
    }

    #[test]
    fn test_reset_returns_to_estimate() {
        let mut tracker = tracker();
        tracker.apply_reported(&TokenUsage {
            used: 10,
            total: 20,
            remaining: 10,
            percentage: None,
        });
        tracker.reset();
        assert_eq!(tracker.current(), &TokenBudget::estimated(0, 4000));
    }

    #[test]
    fn test_percentage_and_exhaustion() {
        let budget = TokenBudget::estimated(1000, 4000);
        assert!((budget.percentage() - 25.0).abs() < f64::EPSILON);
        assert!(!budget.is_exhausted());

        let full = TokenBudget::estimated(5000, 4000);
        assert_eq!(full.remaining, 0);
        assert!(full.is_exhausted());
        assert_eq!(TokenBudget::default().percentage(), 0.0);
    }
}
