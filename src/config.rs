//! TOML configuration structs, defaults, and validation.
//!
//! A config file lists the monitored streams plus the tuning knobs for the
//! pipeline, economy, territory alerts, hot zones, notifications, caching and
//! achievements. Every section except `[[streams]]` is optional and falls
//! back to the defaults below.

use crate::events::EventKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("environment variable {0} is not set")]
    MissingSecret(String),
}

impl ConfigError {
    pub fn is_transient(&self) -> bool {
        false
    }
}

// ── Sections ────────────────────────────────────────────────────

/// Top-level configuration parsed from `killfeed.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub economy: EconomyConfig,
    #[serde(default)]
    pub territory: TerritoryConfig,
    #[serde(default)]
    pub hotzone: HotzoneConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_achievements")]
    pub achievements: Vec<AchievementDef>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pipeline: PipelineConfig::default(),
            fetch: FetchConfig::default(),
            streams: Vec::new(),
            economy: EconomyConfig::default(),
            territory: TerritoryConfig::default(),
            hotzone: HotzoneConfig::default(),
            notifications: NotificationConfig::default(),
            cache: CacheConfig::default(),
            achievements: default_achievements(),
        }
    }
}

/// The `[pipeline]` section: cycle cadence and per-step bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub commit_timeout_secs: u64,
    /// Maximum pending events dispatched per cycle.
    pub dispatch_batch: i64,
    pub store_retry_attempts: u32,
    pub store_retry_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            interval_secs: 30,
            fetch_timeout_secs: 90,
            commit_timeout_secs: 30,
            dispatch_batch: 500,
            store_retry_attempts: 3,
            store_retry_delay_ms: 500,
        }
    }
}

impl PipelineConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }

    pub fn store_retry_delay(&self) -> Duration {
        Duration::from_millis(self.store_retry_delay_ms)
    }
}

/// The `[fetch]` section: connection retry policy shared by all streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            max_attempts: 3,
            base_delay_ms: 2000,
            connect_timeout_secs: 20,
        }
    }
}

impl FetchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// One `[[streams]]` entry: a remote log to tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    pub username: String,
    /// Name of the environment variable holding the password.
    pub password_env: String,
    #[serde(default = "default_directories")]
    pub directories: Vec<String>,
    /// Fixed file name; when absent the newest file by extension is used.
    pub file_name: Option<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// Permit a plaintext retry when the TLS handshake fails.
    #[serde(default)]
    pub allow_insecure_fallback: bool,
    #[serde(default)]
    pub backfill: bool,
}

impl StreamConfig {
    pub fn password(&self) -> Result<String, ConfigError> {
        std::env::var(&self.password_env)
            .map_err(|_| ConfigError::MissingSecret(self.password_env.clone()))
    }
}

fn default_ftp_port() -> u16 {
    21
}

fn default_directories() -> Vec<String> {
    vec![
        "dayzxb/profile".to_string(),
        "dayzxb_missions/dayzOffline.chernarusplus".to_string(),
        String::new(),
    ]
}

fn default_extensions() -> Vec<String> {
    vec![".ADM".to_string(), ".RPT".to_string()]
}

fn default_true() -> bool {
    true
}

/// The `[economy]` section: currency deltas per event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    pub kill_reward: i64,
    pub zombie_kill_reward: i64,
    pub fish_reward: i64,
    pub placement_reward: i64,
    pub death_penalty: i64,
    /// Paid on connection when no bonus was paid in the previous 24 hours.
    pub daily_bonus: i64,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        EconomyConfig {
            kill_reward: 50,
            zombie_kill_reward: 0,
            fish_reward: 0,
            placement_reward: 0,
            death_penalty: 0,
            daily_bonus: 500,
        }
    }
}

impl EconomyConfig {
    /// Delta credited to the event's actor.
    pub fn delta_for(&self, kind: EventKind) -> i64 {
        match kind {
            EventKind::Kill => self.kill_reward,
            EventKind::ZombieKill => self.zombie_kill_reward,
            EventKind::FishCaught => self.fish_reward,
            EventKind::Placement => self.placement_reward,
            EventKind::Death => -self.death_penalty,
            EventKind::Connection => 0,
        }
    }
}

/// The `[territory]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerritoryConfig {
    /// Distance beyond a base radius that still raises an alert.
    pub alert_margin: f64,
}

impl Default for TerritoryConfig {
    fn default() -> Self {
        TerritoryConfig {
            alert_margin: 200.0,
        }
    }
}

/// The `[hotzone]` section: combat clustering broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotzoneConfig {
    pub enabled: bool,
    pub radius: f64,
    pub window_minutes: i64,
    pub threshold: i64,
}

impl Default for HotzoneConfig {
    fn default() -> Self {
        HotzoneConfig {
            enabled: true,
            radius: 500.0,
            window_minutes: 15,
            threshold: 3,
        }
    }
}

/// The `[notifications]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    /// Environment variable consulted when `webhook_url` is unset.
    pub webhook_url_env: String,
    pub username: String,
    pub timeout_secs: u64,
    /// Post a killfeed message for every PvP kill.
    pub announce_kills: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            webhook_url: None,
            webhook_url_env: "KILLFEED_WEBHOOK_URL".to_string(),
            username: "Killfeed".to_string(),
            timeout_secs: 10,
            announce_kills: true,
        }
    }
}

impl NotificationConfig {
    pub fn resolved_webhook_url(&self) -> Option<String> {
        self.webhook_url
            .clone()
            .or_else(|| std::env::var(&self.webhook_url_env).ok())
            .filter(|u| !u.trim().is_empty())
    }
}

/// The `[cache]` section: identity and clan lookup caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 4096,
            ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// One `[[achievements]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementDef {
    pub key: String,
    pub name: String,
    pub event: EventKind,
    pub target: i64,
    #[serde(default)]
    pub reward: i64,
}

fn default_achievements() -> Vec<AchievementDef> {
    [
        ("first_kill", "First Blood", 1, 500),
        ("killer_10", "Assassin", 10, 1000),
        ("killer_50", "Executioner", 50, 5000),
        ("killer_100", "Warlord", 100, 10000),
        ("killer_500", "Legend", 500, 50000),
    ]
    .into_iter()
    .map(|(key, name, target, reward)| AchievementDef {
        key: key.to_string(),
        name: name.to_string(),
        event: EventKind::Kill,
        target,
        reward,
    })
    .collect()
}

// ── Loading ─────────────────────────────────────────────────────

impl Config {
    /// Parse and validate a configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.pipeline.interval_secs == 0 {
            return invalid("pipeline.interval_secs must be positive".into());
        }
        if self.pipeline.dispatch_batch <= 0 {
            return invalid("pipeline.dispatch_batch must be positive".into());
        }
        if self.fetch.max_attempts == 0 {
            return invalid("fetch.max_attempts must be at least 1".into());
        }

        let mut names = HashSet::new();
        for stream in &self.streams {
            if stream.name.trim().is_empty() {
                return invalid("stream name must not be empty".into());
            }
            if !names.insert(stream.name.as_str()) {
                return invalid(format!("duplicate stream name '{}'", stream.name));
            }
            if stream.directories.is_empty() {
                return invalid(format!("stream '{}' has no directories", stream.name));
            }
            if stream.file_name.is_none() && stream.extensions.is_empty() {
                return invalid(format!(
                    "stream '{}' needs a file_name or at least one extension",
                    stream.name
                ));
            }
        }

        if self.territory.alert_margin < 0.0 {
            return invalid("territory.alert_margin must not be negative".into());
        }
        if self.hotzone.radius <= 0.0 || self.hotzone.radius > 500.0 {
            return invalid("hotzone.radius must be in (0, 500]".into());
        }
        if self.hotzone.threshold < 1 || self.hotzone.window_minutes < 1 {
            return invalid("hotzone.threshold and hotzone.window_minutes must be positive".into());
        }
        if self.cache.capacity == 0 {
            return invalid("cache.capacity must be positive".into());
        }

        let mut keys = HashSet::new();
        for a in &self.achievements {
            if !keys.insert(a.key.as_str()) {
                return invalid(format!("duplicate achievement key '{}'", a.key));
            }
            if a.target <= 0 {
                return invalid(format!("achievement '{}' needs a positive target", a.key));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[streams]]
name = "chernarus-adm"
host = "ftp.example.net"
username = "gameadmin"
password_env = "KILLFEED_FTP_PASSWORD"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.pipeline.interval_secs, 30);
        assert_eq!(config.economy.kill_reward, 50);
        assert_eq!(config.economy.daily_bonus, 500);
        assert_eq!(config.territory.alert_margin, 200.0);
        assert_eq!(config.achievements.len(), 5);
        let s = &config.streams[0];
        assert_eq!(s.port, 21);
        assert!(s.use_tls);
        assert!(!s.allow_insecure_fallback);
        assert_eq!(s.extensions, vec![".ADM", ".RPT"]);
        assert_eq!(s.directories.len(), 3);
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let config = Config::parse(include_str!("../killfeed.toml")).unwrap();
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.achievements.len(), 5);
        assert_eq!(config.hotzone.threshold, 3);
    }

    #[test]
    fn achievements_section_replaces_defaults() {
        let toml = format!(
            "{MINIMAL}\n[[achievements]]\nkey = \"angler\"\nname = \"Angler\"\nevent = \"fish_caught\"\ntarget = 10\nreward = 100\n"
        );
        let config = Config::parse(&toml).unwrap();
        assert_eq!(config.achievements.len(), 1);
        assert_eq!(config.achievements[0].event, EventKind::FishCaught);
    }

    #[test]
    fn duplicate_stream_names_rejected() {
        let toml = format!("{MINIMAL}{MINIMAL}");
        let err = Config::parse(&toml).unwrap_err();
        assert!(err.to_string().contains("duplicate stream"));
    }

    #[test]
    fn empty_directories_rejected() {
        let toml = format!("{MINIMAL}directories = []\n");
        assert!(matches!(
            Config::parse(&toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn non_positive_target_rejected() {
        let toml = "[[achievements]]\nkey = \"x\"\nname = \"X\"\nevent = \"kill\"\ntarget = 0\n";
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn hotzone_radius_bounds() {
        assert!(Config::parse("[hotzone]\nradius = 0.0\n").is_err());
        assert!(Config::parse("[hotzone]\nradius = 501.0\n").is_err());
        assert!(Config::parse("[hotzone]\nradius = 500.0\n").is_ok());
    }

    #[test]
    fn syntax_error_is_parse_error() {
        assert!(matches!(
            Config::parse("[pipeline\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn economy_deltas_by_kind() {
        let e = EconomyConfig {
            death_penalty: 25,
            ..EconomyConfig::default()
        };
        assert_eq!(e.delta_for(EventKind::Kill), 50);
        assert_eq!(e.delta_for(EventKind::Death), -25);
        assert_eq!(e.delta_for(EventKind::Connection), 0);
    }

    #[test]
    fn missing_password_env_is_reported() {
        let mut config = Config::parse(MINIMAL).unwrap();
        config.streams[0].password_env = "KILLFEED_TEST_UNSET_PASSWORD_VAR".into();
        assert!(matches!(
            config.streams[0].password(),
            Err(ConfigError::MissingSecret(_))
        ));
    }
}
