//! Token estimation and context budget tracking

pub mod token_budget;
pub mod token_estimator;

pub use token_budget::{BudgetSource, TokenBudget, TokenBudgetTracker};
pub use token_estimator::{
    build_estimator, ScriptAwareEstimator, TiktokenEstimator, TokenEstimator,
};
