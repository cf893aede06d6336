use std::time::Instant;
use tracing::{info, warn};

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    pub fn finish(self) {
        info!(
            operation = %self.operation,
            duration_ms = self.elapsed_ms() as u64,
            "Operation completed"
        );
    }

    pub fn fail(self, error: &dyn std::fmt::Display) {
        warn!(
            operation = %self.operation,
            duration_ms = self.elapsed_ms() as u64,
            error = %error,
            "Operation failed"
        );
    }
}

/// Finish `timer` according to `result` and pass the result through
pub fn timed<T, E: std::fmt::Display>(timer: OperationTimer, result: Result<T, E>) -> Result<T, E> {
    match &result {
        Ok(_) => timer.finish(),
        Err(e) => timer.fail(e),
    }
    result
}
