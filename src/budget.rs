use tracing::warn;

/// Decision returned by the budget when a plateau has been detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReductionDecision {
    /// A reduction is still allowed (includes the 1-based number it would be).
    Reduce { attempt: u32 },
    /// Every allowed reduction has been used; stop training.
    Exhausted,
}

/// Bounded count of hyperparameter reductions.
///
/// Lives for the whole controller run. `used` never exceeds `max_reductions`.
#[derive(Debug, Clone)]
pub struct ReductionBudget {
    max_reductions: u32,
    used: u32,
}

impl ReductionBudget {
    pub fn new(max_reductions: u32) -> Self {
        Self {
            max_reductions,
            used: 0,
        }
    }

    /// What a plateau should lead to right now. Does not consume anything.
    pub fn check(&self) -> ReductionDecision {
        if self.used < self.max_reductions {
            ReductionDecision::Reduce {
                attempt: self.used + 1,
            }
        } else {
            ReductionDecision::Exhausted
        }
    }

    /// Record one reduction. Returns the new count.
    ///
    /// Has no effect once the budget is exhausted.
    pub fn consume(&mut self) -> u32 {
        if self.used < self.max_reductions {
            self.used += 1;
        } else {
            warn!(
                max_reductions = self.max_reductions,
                "reduction requested with exhausted budget, ignoring"
            );
        }
        self.used
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max_reductions(&self) -> u32 {
        self.max_reductions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_budget_allows_first_reduction() {
        let budget = ReductionBudget::new(2);
        assert_eq!(budget.check(), ReductionDecision::Reduce { attempt: 1 });
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_check_does_not_consume() {
        let budget = ReductionBudget::new(1);
        budget.check();
        budget.check();
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_exhausted_after_max_reductions() {
        let mut budget = ReductionBudget::new(2);
        assert_eq!(budget.consume(), 1);
        assert_eq!(budget.check(), ReductionDecision::Reduce { attempt: 2 });
        assert_eq!(budget.consume(), 2);
        assert_eq!(budget.check(), ReductionDecision::Exhausted);
    }

    #[test]
    fn test_consume_never_exceeds_bound() {
        let mut budget = ReductionBudget::new(1);
        for _ in 0..5 {
            budget.consume();
            assert!(budget.used() <= budget.max_reductions());
        }
        assert_eq!(budget.used(), 1);
        assert_eq!(budget.check(), ReductionDecision::Exhausted);
    }

    #[test]
    fn test_zero_budget_is_exhausted_immediately() {
        let mut budget = ReductionBudget::new(0);
        assert_eq!(budget.check(), ReductionDecision::Exhausted);
        assert_eq!(budget.consume(), 0);
    }
}
