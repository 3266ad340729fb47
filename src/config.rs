use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::DEFAULT_PROGRESS_INTERVAL;
use crate::feed::DEFAULT_PAGE_SIZE;
use crate::hub::DEFAULT_HUB_URL;
use crate::ipfs::DEFAULT_API_URL;
use crate::publish::DEFAULT_GATEWAY_URL;

const DEFAULT_ENV_PREFIX: &str = "LEMON3";

/// Keys `config ls` prints, in order.
pub const KEYS: &[&str] = &[
    "hub.url",
    "hub.api_key",
    "hub.poll_interval",
    "ipfs.api_url",
    "ipfs.gateway_url",
    "account.fid",
    "account.fname",
    "account.private_key",
    "download.dir",
    "download.progress_interval",
    "feed.page_size",
    "feed.max_pages",
];

const SECRET_KEYS: &[&str] = &["hub.api_key", "account.private_key"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub ipfs: IpfsConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    #[serde(default = "default_hub_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            api_key: String::new(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_hub_url() -> String {
    DEFAULT_HUB_URL.into()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpfsConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            gateway_url: default_gateway_url(),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.into()
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.into()
}

/// The identity casts are published under. `fid` 0 means "look it up by fname".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AccountConfig {
    #[serde(default)]
    pub fid: u64,
    #[serde(default)]
    pub fname: String,
    /// Hex-encoded Ed25519 app key seed.
    #[serde(default)]
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadConfig {
    /// Root of per-author download directories; the working directory when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_progress_interval", with = "humantime_serde")]
    pub progress_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: None,
            progress_interval: default_progress_interval(),
        }
    }
}

impl DownloadConfig {
    pub fn root(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

fn default_progress_interval() -> Duration {
    DEFAULT_PROGRESS_INTERVAL
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Stop a sync pass after this many pages; unlimited when unset.
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_pages: None,
        }
    }
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let path = options.config_file.or_else(default_config_path);
    let mut cfg = match path {
        Some(path) if path.exists() => read_config_file(&path)?,
        _ => Config::default(),
    };

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix)?;

    Ok(cfg)
}

/// The file contents alone, without environment overrides. Missing files
/// read as defaults.
pub fn load_file(path: &Path) -> Result<Config> {
    if path.exists() {
        read_config_file(path)
    } else {
        Ok(Config::default())
    }
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    if data.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn apply_env(cfg: &mut Config, prefix: &str) -> Result<()> {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        // LEMON3_LOG and friends share the prefix but are not config keys.
        if !KEYS.contains(&key.as_str()) {
            continue;
        }
        set_key(cfg, &key, &value).with_context(|| format!("config: environment override {key}"))?;
    }
    Ok(())
}

/// Sets a dotted key from its string form. An empty value resets optional
/// keys.
pub fn set_key(cfg: &mut Config, key: &str, value: &str) -> Result<()> {
    let value = value.trim();
    match key {
        "hub.url" => cfg.hub.url = non_empty_or(value, default_hub_url),
        "hub.api_key" => cfg.hub.api_key = value.to_string(),
        "hub.poll_interval" => cfg.hub.poll_interval = parse_duration(key, value)?,
        "ipfs.api_url" => cfg.ipfs.api_url = non_empty_or(value, default_api_url),
        "ipfs.gateway_url" => cfg.ipfs.gateway_url = value.to_string(),
        "account.fid" => {
            cfg.account.fid = if value.is_empty() {
                0
            } else {
                value
                    .parse()
                    .with_context(|| format!("config: {key} must be a number"))?
            }
        }
        "account.fname" => cfg.account.fname = value.trim_start_matches('@').to_string(),
        "account.private_key" => cfg.account.private_key = value.to_string(),
        "download.dir" => {
            cfg.download.dir = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        "download.progress_interval" => {
            cfg.download.progress_interval = parse_duration(key, value)?
        }
        "feed.page_size" => {
            let size: u32 = value
                .parse()
                .with_context(|| format!("config: {key} must be a number"))?;
            anyhow::ensure!(size > 0, "config: {key} must be positive");
            cfg.feed.page_size = size;
        }
        "feed.max_pages" => {
            cfg.feed.max_pages = if value.is_empty() {
                None
            } else {
                Some(
                    value
                        .parse()
                        .with_context(|| format!("config: {key} must be a number"))?,
                )
            }
        }
        _ => bail!("config: unknown key {key}"),
    }
    Ok(())
}

pub fn get_key(cfg: &Config, key: &str) -> Result<String> {
    let value = match key {
        "hub.url" => cfg.hub.url.clone(),
        "hub.api_key" => cfg.hub.api_key.clone(),
        "hub.poll_interval" => humantime::format_duration(cfg.hub.poll_interval).to_string(),
        "ipfs.api_url" => cfg.ipfs.api_url.clone(),
        "ipfs.gateway_url" => cfg.ipfs.gateway_url.clone(),
        "account.fid" => cfg.account.fid.to_string(),
        "account.fname" => cfg.account.fname.clone(),
        "account.private_key" => cfg.account.private_key.clone(),
        "download.dir" => cfg
            .download
            .dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
        "download.progress_interval" => {
            humantime::format_duration(cfg.download.progress_interval).to_string()
        }
        "feed.page_size" => cfg.feed.page_size.to_string(),
        "feed.max_pages" => cfg
            .feed
            .max_pages
            .map(|pages| pages.to_string())
            .unwrap_or_default(),
        _ => bail!("config: unknown key {key}"),
    };
    Ok(value)
}

/// Every key and its value, secrets masked.
pub fn entries(cfg: &Config) -> Vec<(&'static str, String)> {
    KEYS.iter()
        .map(|key| {
            let value = get_key(cfg, key).unwrap_or_default();
            let shown = if SECRET_KEYS.contains(key) && !value.is_empty() {
                "********".to_string()
            } else {
                value
            };
            (*key, shown)
        })
        .collect()
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("config: {key} must be a duration such as 2s or 100ms"))
}

fn non_empty_or(value: &str, fallback: fn() -> String) -> String {
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lemon3").join("config.yaml"))
}

pub fn save(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(cfg).context("config: failed to serialize config")?;
    fs::write(path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    fn options(path: PathBuf, prefix: &str) -> LoadOptions {
        LoadOptions {
            config_file: Some(path),
            env_prefix: Some(prefix.into()),
        }
    }

    #[test]
    fn load_defaults_without_files() {
        let dir = tempdir().unwrap();
        let cfg = load(options(dir.path().join("missing.yaml"), "LEMON3_TEST_NONE")).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.hub.url, DEFAULT_HUB_URL);
        assert_eq!(cfg.feed.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(cfg.download.progress_interval, Duration::from_millis(100));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "account:\n  fname: alice\nhub:\n  poll_interval: 5s\n",
        )
        .unwrap();
        let cfg = load(options(path, "LEMON3_TEST_PARTIAL")).unwrap();
        assert_eq!(cfg.account.fname, "alice");
        assert_eq!(cfg.hub.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.ipfs.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn set_then_save_round_trips_through_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut cfg = load_file(&path).unwrap();
        set_key(&mut cfg, "account.fid", "3").unwrap();
        set_key(&mut cfg, "account.fname", "@alice").unwrap();
        set_key(&mut cfg, "feed.max_pages", "4").unwrap();
        set_key(&mut cfg, "download.progress_interval", "250ms").unwrap();
        save(&path, &cfg).unwrap();

        let saved = load_file(&path).unwrap();
        assert_eq!(saved, cfg);
        assert_eq!(get_key(&saved, "account.fname").unwrap(), "alice");
        assert_eq!(get_key(&saved, "download.progress_interval").unwrap(), "250ms");
        assert_eq!(saved.feed.max_pages, Some(4));
    }

    #[test]
    fn bad_values_and_keys_are_rejected() {
        let mut cfg = Config::default();
        assert!(set_key(&mut cfg, "account.fid", "three").is_err());
        assert!(set_key(&mut cfg, "feed.page_size", "0").is_err());
        assert!(set_key(&mut cfg, "hub.poll_interval", "soon").is_err());
        assert!(set_key(&mut cfg, "nope", "1").is_err());
        assert!(get_key(&cfg, "hub").is_err());
    }

    #[test]
    fn empty_values_reset_optional_keys() {
        let mut cfg = Config::default();
        set_key(&mut cfg, "download.dir", "/tmp/x").unwrap();
        set_key(&mut cfg, "download.dir", "").unwrap();
        assert_eq!(cfg.download.dir, None);
        set_key(&mut cfg, "hub.url", "").unwrap();
        assert_eq!(cfg.hub.url, DEFAULT_HUB_URL);
    }

    #[test]
    fn listing_masks_secrets() {
        let mut cfg = Config::default();
        cfg.account.private_key = "abcd".into();
        let listed = entries(&cfg);
        assert_eq!(listed.len(), KEYS.len());
        let key = listed
            .iter()
            .find(|(key, _)| *key == "account.private_key")
            .unwrap();
        assert_eq!(key.1, "********");
        let api_key = listed.iter().find(|(key, _)| *key == "hub.api_key").unwrap();
        assert_eq!(api_key.1, "");
    }

    #[test]
    fn env_overrides() {
        let dir = tempdir().unwrap();
        env::set_var("LEMON3_TEST_ENV_FEED__PAGE_SIZE", "25");
        env::set_var("LEMON3_TEST_ENV_LOG", "debug");
        let cfg = load(options(dir.path().join("none.yaml"), "LEMON3_TEST_ENV")).unwrap();
        env::remove_var("LEMON3_TEST_ENV_FEED__PAGE_SIZE");
        env::remove_var("LEMON3_TEST_ENV_LOG");
        assert_eq!(cfg.feed.page_size, 25);
    }
}
