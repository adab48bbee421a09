use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs::{self, File};
use std::path::Path;
use std::str::FromStr;

use crate::signal::pair_key;

const DEFAULT_FEED_NAME: &str = "polygon";
const DEFAULT_VENUE_NAME: &str = "paper";
const DEFAULT_POLYGON_BASE_URL: &str = "https://api.polygon.io";
const DEFAULT_PAIR_FILE: &str = "pairs.txt";
const DEFAULT_TRADES_FILE: &str = "trades.json";
const DEFAULT_PROFITS_FILE: &str = "profits.json";
const DEFAULT_CAPITAL_PER_TRADE: Decimal = dec!(500);
const DEFAULT_ENTER_THRESHOLD_SHORT: f64 = 1.8;
const DEFAULT_ENTER_THRESHOLD_LONG: f64 = -1.8;
const DEFAULT_EXIT_Z_LOW: f64 = -0.35;
const DEFAULT_EXIT_Z_HIGH: f64 = 0.35;
const DEFAULT_ZSCORE_WINDOW: usize = 40;
const DEFAULT_MIN_BAR_SAMPLES: usize = 150;
const DEFAULT_LOOKBACK_DAYS: u32 = 5;
const DEFAULT_BAR_INTERVAL_MIN: u32 = 5;
const DEFAULT_POLL_SLEEP_SECS: u64 = 100;
const DEFAULT_COOLDOWN_SECS: i64 = 1000;
const DEFAULT_PRIMARY_CLIENT_ID: u32 = 2;
const DEFAULT_CLIENT_ID_BASE: u32 = 3;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_PARALLEL_SESSIONS: usize = 8;
const DEFAULT_SESSION_STAGGER_MS: u64 = 1000;
const DEFAULT_TICK_SIZE: Decimal = dec!(0.01);
const DEFAULT_ENTRY_INITIAL_TIMEOUT_SECS: u64 = 3;
const DEFAULT_ENTRY_ESCALATION_TIMEOUT_SECS: u64 = 2;
const DEFAULT_ENTRY_MAX_ESCALATIONS: u32 = 3;
const DEFAULT_EXIT_INITIAL_TIMEOUT_SECS: u64 = 5;
const DEFAULT_EXIT_ESCALATION_TIMEOUT_SECS: u64 = 3;
const DEFAULT_EXIT_MAX_ESCALATIONS: u32 = 2;
const DEFAULT_ENTRY_MARKET_TIMEOUT_SECS: u64 = 20;
const DEFAULT_ORDER_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSpec {
    pub first: String,
    pub second: String,
}

impl PairSpec {
    pub fn key(&self) -> String {
        pair_key(&self.first, &self.second)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct BotYaml {
    feed_name: Option<String>,
    venue_name: Option<String>,
    polygon_api_key: Option<String>,
    polygon_base_url: Option<String>,
    pair_file: Option<String>,
    trades_file: Option<String>,
    profits_file: Option<String>,
    capital_per_trade: Option<Decimal>,
    enter_threshold_short: Option<f64>,
    enter_threshold_long: Option<f64>,
    z_score_exit_low: Option<f64>,
    z_score_exit_high: Option<f64>,
    z_score_window: Option<usize>,
    min_bar_samples: Option<usize>,
    data_lookback_days: Option<u32>,
    data_interval_min: Option<u32>,
    fetch_sleep_interval_secs: Option<u64>,
    cooldown_secs: Option<i64>,
    primary_client_id: Option<u32>,
    client_id_base: Option<u32>,
    batch_size: Option<usize>,
    max_parallel_sessions: Option<usize>,
    session_stagger_ms: Option<u64>,
    tick_size: Option<Decimal>,
    entry_initial_timeout_secs: Option<u64>,
    entry_escalation_timeout_secs: Option<u64>,
    entry_max_escalations: Option<u32>,
    exit_initial_timeout_secs: Option<u64>,
    exit_escalation_timeout_secs: Option<u64>,
    exit_max_escalations: Option<u32>,
    entry_market_timeout_secs: Option<u64>,
    order_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub feed_name: String,
    pub venue_name: String,
    pub polygon_api_key: String,
    pub polygon_base_url: String,
    pub pair_file: String,
    pub trades_file: String,
    pub profits_file: String,
    pub capital_per_trade: Decimal,
    pub enter_threshold_short: f64,
    pub enter_threshold_long: f64,
    pub exit_z_low: f64,
    pub exit_z_high: f64,
    pub zscore_window: usize,
    pub min_bar_samples: usize,
    pub lookback_days: u32,
    pub bar_interval_min: u32,
    pub poll_sleep_secs: u64,
    pub cooldown_secs: i64,
    pub primary_client_id: u32,
    pub client_id_base: u32,
    pub batch_size: usize,
    pub max_parallel_sessions: usize,
    pub session_stagger_ms: u64,
    pub tick_size: Decimal,
    pub entry_initial_timeout_secs: u64,
    pub entry_escalation_timeout_secs: u64,
    pub entry_max_escalations: u32,
    pub exit_initial_timeout_secs: u64,
    pub exit_escalation_timeout_secs: u64,
    pub exit_max_escalations: u32,
    pub entry_market_timeout_secs: u64,
    pub order_poll_interval_ms: u64,
}

impl BotConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("PAIRBOT_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        let cfg = Self::from_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open config {}", path_ref.display()))?;
        let yaml: BotYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))?;

        let defaults = Self::defaults();
        let mut cfg = BotConfig {
            feed_name: yaml.feed_name.unwrap_or(defaults.feed_name),
            venue_name: yaml.venue_name.unwrap_or(defaults.venue_name),
            polygon_api_key: yaml.polygon_api_key.unwrap_or(defaults.polygon_api_key),
            polygon_base_url: yaml.polygon_base_url.unwrap_or(defaults.polygon_base_url),
            pair_file: yaml.pair_file.unwrap_or(defaults.pair_file),
            trades_file: yaml.trades_file.unwrap_or(defaults.trades_file),
            profits_file: yaml.profits_file.unwrap_or(defaults.profits_file),
            capital_per_trade: yaml.capital_per_trade.unwrap_or(defaults.capital_per_trade),
            enter_threshold_short: yaml
                .enter_threshold_short
                .unwrap_or(defaults.enter_threshold_short),
            enter_threshold_long: yaml
                .enter_threshold_long
                .unwrap_or(defaults.enter_threshold_long),
            exit_z_low: yaml.z_score_exit_low.unwrap_or(defaults.exit_z_low),
            exit_z_high: yaml.z_score_exit_high.unwrap_or(defaults.exit_z_high),
            zscore_window: yaml.z_score_window.unwrap_or(defaults.zscore_window),
            min_bar_samples: yaml.min_bar_samples.unwrap_or(defaults.min_bar_samples),
            lookback_days: yaml.data_lookback_days.unwrap_or(defaults.lookback_days),
            bar_interval_min: yaml.data_interval_min.unwrap_or(defaults.bar_interval_min),
            poll_sleep_secs: yaml
                .fetch_sleep_interval_secs
                .unwrap_or(defaults.poll_sleep_secs),
            cooldown_secs: yaml.cooldown_secs.unwrap_or(defaults.cooldown_secs),
            primary_client_id: yaml.primary_client_id.unwrap_or(defaults.primary_client_id),
            client_id_base: yaml.client_id_base.unwrap_or(defaults.client_id_base),
            batch_size: yaml.batch_size.unwrap_or(defaults.batch_size),
            max_parallel_sessions: yaml
                .max_parallel_sessions
                .unwrap_or(defaults.max_parallel_sessions),
            session_stagger_ms: yaml
                .session_stagger_ms
                .unwrap_or(defaults.session_stagger_ms),
            tick_size: yaml.tick_size.unwrap_or(defaults.tick_size),
            entry_initial_timeout_secs: yaml
                .entry_initial_timeout_secs
                .unwrap_or(defaults.entry_initial_timeout_secs),
            entry_escalation_timeout_secs: yaml
                .entry_escalation_timeout_secs
                .unwrap_or(defaults.entry_escalation_timeout_secs),
            entry_max_escalations: yaml
                .entry_max_escalations
                .unwrap_or(defaults.entry_max_escalations),
            exit_initial_timeout_secs: yaml
                .exit_initial_timeout_secs
                .unwrap_or(defaults.exit_initial_timeout_secs),
            exit_escalation_timeout_secs: yaml
                .exit_escalation_timeout_secs
                .unwrap_or(defaults.exit_escalation_timeout_secs),
            exit_max_escalations: yaml
                .exit_max_escalations
                .unwrap_or(defaults.exit_max_escalations),
            entry_market_timeout_secs: yaml
                .entry_market_timeout_secs
                .unwrap_or(defaults.entry_market_timeout_secs),
            order_poll_interval_ms: yaml
                .order_poll_interval_ms
                .unwrap_or(defaults.order_poll_interval_ms),
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::defaults();
        cfg.apply_env_overrides();
        cfg
    }

    fn defaults() -> Self {
        BotConfig {
            feed_name: DEFAULT_FEED_NAME.to_string(),
            venue_name: DEFAULT_VENUE_NAME.to_string(),
            polygon_api_key: String::new(),
            polygon_base_url: DEFAULT_POLYGON_BASE_URL.to_string(),
            pair_file: DEFAULT_PAIR_FILE.to_string(),
            trades_file: DEFAULT_TRADES_FILE.to_string(),
            profits_file: DEFAULT_PROFITS_FILE.to_string(),
            capital_per_trade: DEFAULT_CAPITAL_PER_TRADE,
            enter_threshold_short: DEFAULT_ENTER_THRESHOLD_SHORT,
            enter_threshold_long: DEFAULT_ENTER_THRESHOLD_LONG,
            exit_z_low: DEFAULT_EXIT_Z_LOW,
            exit_z_high: DEFAULT_EXIT_Z_HIGH,
            zscore_window: DEFAULT_ZSCORE_WINDOW,
            min_bar_samples: DEFAULT_MIN_BAR_SAMPLES,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            bar_interval_min: DEFAULT_BAR_INTERVAL_MIN,
            poll_sleep_secs: DEFAULT_POLL_SLEEP_SECS,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            primary_client_id: DEFAULT_PRIMARY_CLIENT_ID,
            client_id_base: DEFAULT_CLIENT_ID_BASE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_parallel_sessions: DEFAULT_MAX_PARALLEL_SESSIONS,
            session_stagger_ms: DEFAULT_SESSION_STAGGER_MS,
            tick_size: DEFAULT_TICK_SIZE,
            entry_initial_timeout_secs: DEFAULT_ENTRY_INITIAL_TIMEOUT_SECS,
            entry_escalation_timeout_secs: DEFAULT_ENTRY_ESCALATION_TIMEOUT_SECS,
            entry_max_escalations: DEFAULT_ENTRY_MAX_ESCALATIONS,
            exit_initial_timeout_secs: DEFAULT_EXIT_INITIAL_TIMEOUT_SECS,
            exit_escalation_timeout_secs: DEFAULT_EXIT_ESCALATION_TIMEOUT_SECS,
            exit_max_escalations: DEFAULT_EXIT_MAX_ESCALATIONS,
            entry_market_timeout_secs: DEFAULT_ENTRY_MARKET_TIMEOUT_SECS,
            order_poll_interval_ms: DEFAULT_ORDER_POLL_INTERVAL_MS,
        }
    }

    fn apply_env_overrides(&mut self) {
        override_string(&mut self.feed_name, "MARKET_DATA_FEED");
        override_string(&mut self.venue_name, "TRADING_VENUE");
        override_string(&mut self.polygon_api_key, "POLYGON_API_KEY");
        override_string(&mut self.polygon_base_url, "POLYGON_BASE_URL");
        override_string(&mut self.pair_file, "PAIR_FILE");
        override_string(&mut self.trades_file, "TRADES_FILE");
        override_string(&mut self.profits_file, "PROFITS_FILE");
        override_parsed(&mut self.capital_per_trade, "CAPITAL_PER_TRADE");
        override_parsed(&mut self.enter_threshold_short, "ENTER_THRESHOLD_SHORT");
        override_parsed(&mut self.enter_threshold_long, "ENTER_THRESHOLD_LONG");
        override_parsed(&mut self.exit_z_low, "Z_SCORE_EXIT_LOW");
        override_parsed(&mut self.exit_z_high, "Z_SCORE_EXIT_HIGH");
        override_parsed(&mut self.zscore_window, "Z_SCORE_WINDOW");
        override_parsed(&mut self.min_bar_samples, "MIN_BAR_SAMPLES");
        override_parsed(&mut self.lookback_days, "DATA_LOOKBACK_DAYS");
        override_parsed(&mut self.bar_interval_min, "DATA_INTERVAL_MIN");
        override_parsed(&mut self.poll_sleep_secs, "FETCH_SLEEP_INTERVAL");
        override_parsed(&mut self.cooldown_secs, "COOLDOWN_SECS");
        override_parsed(&mut self.primary_client_id, "PRIMARY_CLIENT_ID");
        override_parsed(&mut self.client_id_base, "CLIENT_ID_BASE");
        override_parsed(&mut self.batch_size, "BATCH_SIZE");
        override_parsed(&mut self.max_parallel_sessions, "MAX_PARALLEL_SESSIONS");
        override_parsed(&mut self.session_stagger_ms, "SESSION_STAGGER_MS");
        override_parsed(&mut self.tick_size, "TICK_SIZE");
        override_parsed(
            &mut self.entry_initial_timeout_secs,
            "ENTRY_INITIAL_TIMEOUT_SECS",
        );
        override_parsed(
            &mut self.entry_escalation_timeout_secs,
            "ENTRY_ESCALATION_TIMEOUT_SECS",
        );
        override_parsed(&mut self.entry_max_escalations, "ENTRY_MAX_ESCALATIONS");
        override_parsed(
            &mut self.exit_initial_timeout_secs,
            "EXIT_INITIAL_TIMEOUT_SECS",
        );
        override_parsed(
            &mut self.exit_escalation_timeout_secs,
            "EXIT_ESCALATION_TIMEOUT_SECS",
        );
        override_parsed(&mut self.exit_max_escalations, "EXIT_MAX_ESCALATIONS");
        override_parsed(
            &mut self.entry_market_timeout_secs,
            "ENTRY_MARKET_TIMEOUT_SECS",
        );
        override_parsed(&mut self.order_poll_interval_ms, "ORDER_POLL_INTERVAL_MS");
    }

    pub fn validate(&self) -> Result<()> {
        if self.zscore_window < 2 {
            bail!("z_score_window must be at least 2");
        }
        if self.exit_z_low > self.exit_z_high {
            bail!(
                "exit band is inverted: low {} > high {}",
                self.exit_z_low,
                self.exit_z_high
            );
        }
        if self.tick_size <= Decimal::ZERO {
            bail!("tick_size must be positive");
        }
        if self.batch_size == 0 || self.max_parallel_sessions == 0 {
            bail!("batch_size and max_parallel_sessions must be non-zero");
        }
        Ok(())
    }
}

fn override_string(slot: &mut String, key: &str) {
    if let Ok(value) = env::var(key) {
        if !value.trim().is_empty() {
            *slot = value;
        }
    }
}

fn override_parsed<T: FromStr>(slot: &mut T, key: &str) {
    if let Some(value) = env::var(key).ok().and_then(|v| v.parse().ok()) {
        *slot = value;
    }
}

/// Parse the externally supplied pair list. Lines look like
/// `Pair: AAA and BBB, Profit: 12.3`; only the pair identity is used.
/// Unrecognized lines are logged and skipped; an empty result is a startup
/// error.
pub fn load_pair_file<P: AsRef<Path>>(path: P) -> Result<Vec<PairSpec>> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref)
        .with_context(|| format!("failed to open pair file {}", path_ref.display()))?;

    let mut pairs = Vec::new();
    let mut seen = HashSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let head = line.split(", Profit:").next().unwrap_or(line).trim();
        let head = head.strip_prefix("Pair:").map(str::trim).unwrap_or(head);
        let mut symbols = head.split(" and ");
        match (symbols.next(), symbols.next(), symbols.next()) {
            (Some(first), Some(second), None) if !first.is_empty() && !second.is_empty() => {
                let spec = PairSpec {
                    first: first.trim().to_string(),
                    second: second.trim().to_string(),
                };
                if seen.insert(spec.key()) {
                    pairs.push(spec);
                } else {
                    log::debug!("[CONFIG] duplicate pair line ignored: {}", line);
                }
            }
            _ => log::warn!("[CONFIG] unrecognized pair line: {}", line),
        }
    }
    if pairs.is_empty() {
        bail!("pair file {} contains no usable pairs", path_ref.display());
    }
    log::info!(
        "[CONFIG] loaded {} pairs from {}",
        pairs.len(),
        path_ref.display()
    );
    Ok(pairs)
}
