use std::path::PathBuf;

const DATA_DIR: &str = "WARDEN_DATA_DIR";

const DEFAULT_DATA_DIR: &str = "./data";

pub fn get_default_data_dir() -> PathBuf {
    let dir_from_env = std::env::var(DATA_DIR);
    dir_from_env.map_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from)
}

const POLL_INTERVAL: &str = "WARDEN_POLL_INTERVAL";

const DEFAULT_POLL_INTERVAL: u64 = 5;

pub fn get_default_poll_interval() -> u64 {
    let interval_from_env = std::env::var(POLL_INTERVAL);
    interval_from_env.map_or(DEFAULT_POLL_INTERVAL, |res| {
        res.parse().unwrap_or(DEFAULT_POLL_INTERVAL)
    })
}

/// Tokens the threshold monitor accepts as boolean true.
pub fn truthy(token: &str) -> bool {
    matches!(token.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Cap a message for display, keeping the full text elsewhere.
pub fn truncate_message(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let cut: String = msg.chars().take(max).collect();
        format!("{cut}...")
    } else {
        msg.to_string()
    }
}
