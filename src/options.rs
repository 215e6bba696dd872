use serde::{Deserialize, Serialize};

/// What [Limiter::decrement()](crate::Limiter::decrement()) does to the logical counters once it
/// has taken a permit out of circulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecrementMode {
    /// Decrement shrinks the limiter: `current_size` goes down by one and the permit becomes
    /// growth headroom again.
    #[default]
    Shrink,
    /// Decrement grows `current_size` and consumes headroom, exactly like
    /// [Limiter::increment()](crate::Limiter::increment()) does, while still taking a permit out
    /// of circulation.
    ///
    /// Kept for callers that depend on this counter behavior.
    Legacy,
}

/// Construction parameters for a [Limiter](crate::Limiter), e.g. from a config file.
///
/// ```
/// # use capacity_limiter::{DecrementMode, LimiterOptions};
/// let opts: LimiterOptions = serde_json::from_str(r#"{ "max-size": 8, "current-size": 2 }"#)?;
/// assert_eq!(opts.current_size(), 2);
/// assert_eq!(opts.decrement_mode, DecrementMode::Shrink);
/// # Ok::<_, serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LimiterOptions {
    /// Total permits the limiter can ever provision.
    pub max_size: i64,
    /// Permits provisioned at construction. Defaults to `max_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_size: Option<i64>,
    #[serde(default)]
    pub decrement_mode: DecrementMode,
}

impl LimiterOptions {
    pub fn new(max_size: i64) -> Self {
        Self {
            max_size,
            current_size: None,
            decrement_mode: DecrementMode::default(),
        }
    }

    pub fn with_current_size(mut self, current_size: i64) -> Self {
        self.current_size = Some(current_size);
        self
    }

    pub fn with_decrement_mode(mut self, mode: DecrementMode) -> Self {
        self.decrement_mode = mode;
        self
    }

    /// The initial provisioned size, falling back to `max_size`.
    pub fn current_size(&self) -> i64 {
        self.current_size.unwrap_or(self.max_size)
    }
}
