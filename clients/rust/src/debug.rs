//! Env-driven selection tracing.
//!
//! `ABMATRIX_DEBUG_LOG` turns on rule traces (`rules`), bucket traces
//! (`match`) or both (`all`). `ABMATRIX_DEBUG_LOG_SAMPLE_RATE` keeps roughly
//! that fraction of traces per thread. Traces go through `tracing::debug!`.

use std::cell::Cell;
use std::sync::OnceLock;

pub(crate) struct DebugConfig {
    pub(crate) log_rules: bool,
    pub(crate) log_match: bool,
    pub(crate) sample_rate: f64,
}

impl DebugConfig {
    fn from_values(level: &str, sample_rate: Option<&str>) -> Self {
        let level = level.trim().to_ascii_lowercase();
        DebugConfig {
            log_rules: level == "all" || level == "rules",
            log_match: level == "all" || level == "match",
            sample_rate: sample_rate
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(1.0),
        }
    }

    pub(crate) fn trace_rules(&self) -> bool {
        self.log_rules && should_sample(self.sample_rate)
    }

    pub(crate) fn trace_match(&self) -> bool {
        self.log_match && should_sample(self.sample_rate)
    }
}

static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

pub(crate) fn debug_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(|| {
        let level = std::env::var("ABMATRIX_DEBUG_LOG").unwrap_or_default();
        let sample_rate = std::env::var("ABMATRIX_DEBUG_LOG_SAMPLE_RATE").ok();
        DebugConfig::from_values(&level, sample_rate.as_deref())
    })
}

thread_local! {
    static SAMPLE_COUNTER: Cell<u64> = const { Cell::new(0) };
}

fn should_sample(sample_rate: f64) -> bool {
    if sample_rate >= 1.0 {
        return true;
    }
    if sample_rate <= 0.0 {
        return false;
    }
    let interval = (1.0 / sample_rate).round() as u64;
    SAMPLE_COUNTER.with(|c| {
        let n = c.get();
        c.set(n.wrapping_add(1));
        n % interval.max(1) == 0
    })
}
