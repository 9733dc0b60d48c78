//! Paylock - Engine Configuration
//!
//! One struct groups every tunable the engine consumes, with the
//! documented defaults. The binary overrides fields from environment
//! variables; tests shrink the windows to milliseconds.

use chrono::Duration;

/// Tunables for the escrow engine and its sweeper.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Auto-release delay applied when the request omits one or sends an
    /// unparsable/non-positive duration.
    pub default_auto_release: Duration,
    /// Post-delivery window during which auto-release is suppressed so
    /// the buyer can dispute.
    pub dispute_window: Duration,
    /// Time an assigned arbitrator has before the sweeper default-rules.
    pub arbitration_window: Duration,
    /// How often the sweeper wakes.
    pub sweep_interval: std::time::Duration,
    /// Maximum records fetched per sweep query.
    pub sweep_batch: usize,
    /// Maximum planned steps in a multi-step escrow.
    pub max_steps: u32,
    /// Listing limit applied when the caller omits one.
    pub list_default_limit: usize,
    /// Hard cap on listing limits.
    pub list_max_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_auto_release: Duration::minutes(5),
            dispute_window: Duration::hours(24),
            arbitration_window: Duration::hours(72),
            sweep_interval: std::time::Duration::from_secs(30),
            sweep_batch: 100,
            max_steps: 32,
            list_default_limit: 50,
            list_max_limit: 200,
        }
    }
}

impl EngineConfig {
    /// Clamp a caller-supplied listing limit into the configured bounds.
    pub fn clamp_limit(&self, limit: Option<usize>) -> usize {
        match limit {
            Some(0) | None => self.list_default_limit,
            Some(n) => n.min(self.list_max_limit),
        }
    }
}

/// Parse a human-readable duration: an integer followed by `ms`, `s`,
/// `m`, `h`, or `d` ("30s", "5m", "1h"). Returns `None` for anything
/// unparsable or non-positive; callers fall back to their default.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(split);
    let value: i64 = digits.parse().ok()?;
    if value <= 0 {
        return None;
    }
    match unit {
        "ms" => Some(Duration::milliseconds(value)),
        "s" => Some(Duration::seconds(value)),
        "m" => Some(Duration::minutes(value)),
        "h" => Some(Duration::hours(value)),
        "d" => Some(Duration::days(value)),
        _ => None,
    }
}
