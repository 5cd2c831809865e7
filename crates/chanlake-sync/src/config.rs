use std::path::PathBuf;
use std::time::Duration;

use chanlake_capture::DEFAULT_CHANNELS;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub archive_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub channels: Vec<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub lock_stale_after: Duration,
    pub date_spine_years: u32,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./warehouse.db".to_string()),
            archive_dir: std::env::var("ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/raw")),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            channels: std::env::var("CHANLAKE_CHANNELS")
                .ok()
                .map(|v| parse_channel_list(&v))
                .filter(|c| !c.is_empty())
                .unwrap_or_else(default_channels),
            scheduler_enabled: std::env::var("CHANLAKE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CHANLAKE_SYNC_CRON")
                .unwrap_or_else(|_| "0 5 * * *".to_string()),
            lock_stale_after: Duration::from_secs(
                std::env::var("CHANLAKE_LOCK_STALE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            ),
            date_spine_years: std::env::var("CHANLAKE_DATE_SPINE_YEARS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }

    /// Config rooted in a scratch directory; used by tests and one-off runs.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            database_url: format!("sqlite://{}", root.join("warehouse.db").display()),
            archive_dir: root.join("data/raw"),
            reports_dir: root.join("reports"),
            channels: default_channels(),
            scheduler_enabled: false,
            sync_cron: "0 5 * * *".to_string(),
            lock_stale_after: Duration::from_secs(3600),
            date_spine_years: 5,
        }
    }
}

fn default_channels() -> Vec<String> {
    DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect()
}

fn parse_channel_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|c| c.trim().trim_start_matches('@'))
        .filter(|c| !c.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_list_trims_handles_and_blanks() {
        assert_eq!(
            parse_channel_list(" @chemedapp, tikvahpharma ,,"),
            vec!["chemedapp".to_string(), "tikvahpharma".to_string()]
        );
    }

    #[test]
    fn rooted_config_keeps_everything_under_root() {
        let config = SyncConfig::rooted_at("/tmp/chanlake-test");
        assert_eq!(config.archive_dir, PathBuf::from("/tmp/chanlake-test/data/raw"));
        assert!(config.database_url.ends_with("/tmp/chanlake-test/warehouse.db"));
        assert_eq!(config.channels.len(), 3);
    }
}
