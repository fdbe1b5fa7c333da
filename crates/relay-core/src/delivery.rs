use serde::Serialize;

/// Per-publish fan-out accounting: how many deliveries were tried and how they ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.attempted += 1;
        self.failed += 1;
    }

    /// At least one matched connection did not receive the payload.
    pub fn is_degraded(&self) -> bool {
        self.failed > 0
    }
}
