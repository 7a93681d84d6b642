//! Composite agent ranking.
//!
//! Blends responsiveness, reliability, trust and task complexity into one
//! value in [0, 1] used to pick among candidate agents.

use serde::{Deserialize, Serialize};

/// Default complexity when a task does not report one
pub const DEFAULT_TASK_COMPLEXITY: f64 = 0.5;

/// Observed performance of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    /// Mean response time in seconds
    pub avg_response_time_secs: f64,
    /// Fraction of tasks completed successfully, in [0, 1]
    pub success_rate: f64,
    /// Normalized task complexity in [0, 1]
    pub task_complexity: Option<f64>,
}

/// Weights of the rank components. They sum to 1 by default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankWeights {
    pub response_time: f64,
    pub success_rate: f64,
    pub trust: f64,
    pub complexity: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            response_time: 0.2,
            success_rate: 0.3,
            trust: 0.3,
            complexity: 0.2,
        }
    }
}

/// Weighted rank. Response time maps to `1 / (1 + t)` so faster is better.
pub fn compute_rank(performance: &AgentPerformance, trust: f64, weights: &RankWeights) -> f64 {
    let response = 1.0 / (1.0 + performance.avg_response_time_secs.max(0.0));
    let success = performance.success_rate.clamp(0.0, 1.0);
    let complexity = performance
        .task_complexity
        .unwrap_or(DEFAULT_TASK_COMPLEXITY)
        .clamp(0.0, 1.0);

    weights.response_time * response
        + weights.success_rate * success
        + weights.trust * trust.clamp(0.0, 1.0)
        + weights.complexity * complexity
}
