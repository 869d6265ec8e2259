use std::time::Duration;

const DEFAULT_ENCODER_BIN: &str = "ffmpeg";
const DEFAULT_TERM_GRACE_MS: u64 = 5000;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 10_000;
const DEFAULT_LOG_MAX_LINES: usize = 1000;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn encoder_bin() -> String {
    std::env::var("LOOPCAST_ENCODER_BIN")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_ENCODER_BIN.to_string())
}

fn term_grace() -> Duration {
    Duration::from_millis(
        env_u64("LOOPCAST_TERM_GRACE_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(DEFAULT_TERM_GRACE_MS),
    )
}

fn reconcile_interval() -> Option<Duration> {
    // 0 turns the background sweep off; status queries still reconcile inline.
    match env_u64("LOOPCAST_RECONCILE_INTERVAL_MS") {
        Some(0) => None,
        Some(v) => Some(Duration::from_millis(v.clamp(250, 10 * 60 * 1000))),
        None => Some(Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS)),
    }
}

fn log_max_lines() -> usize {
    env_usize("LOOPCAST_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub encoder_bin: String,
    pub term_grace: Duration,
    pub reconcile_interval: Option<Duration>,
    pub log_max_lines: usize,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            encoder_bin: encoder_bin(),
            term_grace: term_grace(),
            reconcile_interval: reconcile_interval(),
            log_max_lines: log_max_lines(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            encoder_bin: DEFAULT_ENCODER_BIN.to_string(),
            term_grace: Duration::from_millis(DEFAULT_TERM_GRACE_MS),
            reconcile_interval: Some(Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS)),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
        }
    }
}
