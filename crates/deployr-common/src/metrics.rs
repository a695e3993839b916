use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-function invocation counters. One row per function, created empty
/// at deploy time, monotonically updated, never decremented.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionMetrics {
    pub id: String,
    pub function_id: String,
    pub function_name: String,
    pub app_name: String,
    pub user_id: String,
    pub invocation_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_execution_time_ms: u64,
    pub min_execution_time_ms: Option<u64>,
    pub max_execution_time_ms: u64,
    pub last_invoked: Option<DateTime<Utc>>,
}

impl FunctionMetrics {
    pub fn empty(function: &crate::Function) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            function_id: function.id.clone(),
            function_name: function.name.clone(),
            app_name: function.app_name.clone(),
            user_id: function.user_id.clone(),
            ..Default::default()
        }
    }

    pub fn record_execution(&mut self, execution_time_ms: u64, successful: bool) {
        self.invocation_count += 1;
        if successful {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.total_execution_time_ms += execution_time_ms;
        self.min_execution_time_ms = Some(match self.min_execution_time_ms {
            Some(min) => min.min(execution_time_ms),
            None => execution_time_ms,
        });
        self.max_execution_time_ms = self.max_execution_time_ms.max(execution_time_ms);
        self.last_invoked = Some(Utc::now());
    }

    pub fn average_execution_time_ms(&self) -> u64 {
        if self.invocation_count == 0 {
            0
        } else {
            self.total_execution_time_ms / self.invocation_count
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.invocation_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.invocation_count as f64 * 100.0
        }
    }
}
