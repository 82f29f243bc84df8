//! Layered, pure-data engine configuration.
//!
//! `EngineConfig` is built once at startup and handed down to every other
//! crate — no crate in this workspace reads environment variables or files
//! directly, matching spec.md §9's "a pure-data Config struct is built at
//! startup and handed down; no back-edges" redesign note.
//!
//! Loading follows the teacher's `mqk-config::load_layered_yaml` shape:
//! defaults, then an optional YAML file, then environment overrides, then
//! canonicalized (sorted keys) and SHA-256 hashed so `bk-journal` can stamp
//! trades with the config that produced them.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Every detector kind that can be toggled via `ENABLE_<SIGNAL>`. Kept as a
/// flat list rather than one bool field per kind so new detectors don't
/// require touching every call site that reads config.
pub const ALL_SIGNAL_KINDS: &[&str] = &[
    "SPIKE",
    "MICRO_CHANNEL",
    "H1",
    "H2",
    "L1",
    "L2",
    "WEDGE",
    "CLIMAX",
    "MTR",
    "FAILED_BREAKOUT",
    "MEASURING_GAP",
    "FINAL_FLAG",
    "DOUBLE_TOP",
    "DOUBLE_BOTTOM",
    "TREND_BAR",
    "REVERSAL_BAR",
    "II_PATTERN",
    "OUTSIDE_BAR",
    "MEASURED_MOVE",
    "TR_BREAKOUT",
    "BREAKOUT_PULLBACK",
    "GAP_BAR",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // --- indicators / lookback ---
    pub ema_period: u32,
    pub atr_period: u32,
    pub lookback: u32,

    // --- dispatcher gating ---
    pub signal_cooldown: u32,
    pub max_stop_atr: f64,
    pub min_spike_bars: u32,
    pub spike_overlap_max: f64,

    // --- higher time-frame ---
    pub htf_timeframe: String,
    pub htf_ema_period: u32,
    pub htf_enabled: bool,

    // --- 20-Gap overextension ---
    pub enable_20gap: bool,
    pub gap_bar_threshold: u32,
    pub htf_bypass_gap_count: u32,

    // --- stops / take-profits ---
    pub hard_stop: bool,
    pub hard_stop_buffer: f64,
    pub soft_stop: bool,
    pub soft_stop_mode: u8,
    pub soft_stop_bars: u32,
    pub tp1_scalp_r: f64,
    pub tp1_close_pct: f64,
    pub runner_tp2_min_atr: f64,
    pub breakeven_atr_mult: f64,
    pub breakeven_points: f64,

    // --- regime-suppression features ---
    pub barb_wire: bool,
    pub measuring_gap: bool,
    pub breakout_mode: bool,
    pub ttr_overlap_ratio: f64,
    pub ttr_range_atr_mult: f64,

    // --- spread / session ---
    pub spread_filter: bool,
    pub spread_max_mult: f64,
    pub weekend_filter: bool,
    pub friday_close_hour_gmt: u32,
    pub sunday_open_hour_gmt: u32,
    pub friday_min_r_to_hold: f64,
    pub monday_gap_reset_atr: f64,

    // --- sizing ---
    pub sizing_small_bal_pct: f64,
    pub sizing_large_bal_pct: f64,
    pub large_bal_threshold: f64,
    pub leverage: f64,

    // --- structural parameters named in spec.md's body but outside the
    //     literal §6.2 key list; still first-class config, not magic
    //     numbers, per the "pure-data Config, no back-edges" redesign note.
    pub swing_confirm_depth: u32,
    pub swing_tentative_depth: u32,
    pub swing_cap: usize,
    pub swing_max_age_bars: u32,
    pub reversal_attempt_max_bars: u32,
    pub max_positions_per_user_per_side: u32,
    pub min_stops_level_points: f64,
    pub broker_retry_max_attempts: u32,
    pub broker_retry_spacing_ms: u64,
    pub strong_trend_score: f64,

    // --- order-flow analyser (§4.J; optional, defaults to multiplier 1.0
    //     everywhere when disabled) ---
    pub enable_order_flow: bool,
    pub order_flow_primary_window_secs: u32,
    pub order_flow_secondary_window_secs: u32,
    pub order_flow_extreme_tps: f64,
    pub order_flow_max_buffer: usize,
    pub absorption_price_atr_mult: f64,
    pub absorption_delta_ratio_min: f64,
    pub climax_volume_mult: f64,
    pub climax_delta_ratio_min: f64,
    pub liquidity_withdrawal_volume_ratio_max: f64,

    /// `ENABLE_<SIGNAL>` flags, keyed by the names in [`ALL_SIGNAL_KINDS`].
    /// Absent keys default to enabled — see [`EngineConfig::signal_enabled`].
    pub enable_signal: BTreeMap<String, bool>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ema_period: 20,
            atr_period: 20,
            lookback: 20,

            signal_cooldown: 3,
            max_stop_atr: 3.0,
            min_spike_bars: 3,
            spike_overlap_max: 0.30,

            htf_timeframe: "1h".to_string(),
            htf_ema_period: 20,
            htf_enabled: true,

            enable_20gap: true,
            gap_bar_threshold: 20,
            htf_bypass_gap_count: 5,

            hard_stop: true,
            hard_stop_buffer: 1.5,
            soft_stop: true,
            soft_stop_mode: 0,
            soft_stop_bars: 2,
            tp1_scalp_r: 1.0,
            tp1_close_pct: 50.0,
            runner_tp2_min_atr: 1.5,
            breakeven_atr_mult: 0.1,
            breakeven_points: 5.0,

            barb_wire: true,
            measuring_gap: true,
            breakout_mode: true,
            ttr_overlap_ratio: 0.40,
            ttr_range_atr_mult: 2.5,

            spread_filter: true,
            spread_max_mult: 2.0,
            weekend_filter: true,
            friday_close_hour_gmt: 22,
            sunday_open_hour_gmt: 0,
            friday_min_r_to_hold: 1.5,
            monday_gap_reset_atr: 0.5,

            sizing_small_bal_pct: 100.0,
            sizing_large_bal_pct: 50.0,
            large_bal_threshold: 1000.0,
            leverage: 20.0,

            swing_confirm_depth: 3,
            swing_tentative_depth: 1,
            swing_cap: 40,
            swing_max_age_bars: 40,
            reversal_attempt_max_bars: 10,
            max_positions_per_user_per_side: 1,
            min_stops_level_points: 30.0,
            broker_retry_max_attempts: 4,
            broker_retry_spacing_ms: 100,
            strong_trend_score: 0.5,

            enable_order_flow: true,
            order_flow_primary_window_secs: 300,
            order_flow_secondary_window_secs: 60,
            order_flow_extreme_tps: 500.0,
            order_flow_max_buffer: 2_000_000,
            absorption_price_atr_mult: 0.10,
            absorption_delta_ratio_min: 0.6,
            climax_volume_mult: 3.0,
            climax_delta_ratio_min: 0.7,
            liquidity_withdrawal_volume_ratio_max: 0.5,

            enable_signal: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// `true` unless explicitly disabled via `ENABLE_<SIGNAL>=false`.
    pub fn signal_enabled(&self, kind: &str) -> bool {
        self.enable_signal.get(kind).copied().unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: EngineConfig,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load `EngineConfig::default()`, deep-merge an optional YAML file over it,
/// then deep-merge `env_overrides` (already-parsed key/value pairs, as the
/// caller — outside this core's scope per spec.md §1 — is responsible for
/// reading `std::env`), canonicalize, and hash.
pub fn load_layered(
    yaml_path: Option<&str>,
    env_overrides: &BTreeMap<String, String>,
) -> Result<LoadedConfig> {
    let mut merged = serde_json::to_value(EngineConfig::default())
        .context("serialize default EngineConfig")?;

    if let Some(path) = yaml_path {
        let s = std::fs::read_to_string(path).with_context(|| format!("read config: {path}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {path}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    if !env_overrides.is_empty() {
        let env_json = env_overrides_to_json(env_overrides);
        deep_merge(&mut merged, env_json);
    }

    let canonical = canonicalize_json(&merged);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let config_hash = hex::encode(hasher.finalize());

    let config: EngineConfig =
        serde_json::from_str(&canonical).context("canonical EngineConfig parse failed")?;

    Ok(LoadedConfig {
        config,
        canonical_json: canonical,
        config_hash,
    })
}

/// Turn a flat `KEY=value` map into nested JSON matching [`EngineConfig`]'s
/// (lowercased, snake_case) field names. Scalar values are parsed as bool,
/// then number, then fall back to string.
fn env_overrides_to_json(overrides: &BTreeMap<String, String>) -> Value {
    let mut map = serde_json::Map::new();
    for (k, v) in overrides {
        let key = k.to_lowercase();
        let value = if let Ok(b) = v.parse::<bool>() {
            Value::Bool(b)
        } else if let Ok(n) = v.parse::<f64>() {
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(v.clone()))
        } else {
            Value::String(v.clone())
        };
        map.insert(key, value);
    }
    Value::Object(map)
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Coalesces repeated identical log messages (spec.md §7: "repeated
/// identical messages are coalesced"). Not itself a logging sink — callers
/// still emit through `tracing`; this just tells them when to stay quiet.
#[derive(Debug, Default)]
pub struct WarnCoalescer {
    counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceOutcome {
    /// First occurrence (or first after a reset) — caller should log.
    Emit,
    /// A repeat — caller should stay silent. Carries the running count.
    Suppressed(u64),
}

impl WarnCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note(&mut self, message: &str) -> CoalesceOutcome {
        let count = self.counts.entry(message.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            CoalesceOutcome::Emit
        } else {
            CoalesceOutcome::Suppressed(*count)
        }
    }

    /// Clear tracked counts (e.g. on regime change, so a recurring warning
    /// gets one fresh `Emit` in the new context).
    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_6_2() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ema_period, 20);
        assert_eq!(cfg.atr_period, 20);
        assert_eq!(cfg.signal_cooldown, 3);
        assert_eq!(cfg.max_stop_atr, 3.0);
        assert_eq!(cfg.hard_stop_buffer, 1.5);
        assert_eq!(cfg.sizing_small_bal_pct, 100.0);
        assert_eq!(cfg.sizing_large_bal_pct, 50.0);
        assert_eq!(cfg.leverage, 20.0);
    }

    #[test]
    fn unknown_signal_defaults_enabled() {
        let cfg = EngineConfig::default();
        assert!(cfg.signal_enabled("H2"));
    }

    #[test]
    fn env_override_wins_over_file_and_defaults() {
        let mut overrides = BTreeMap::new();
        overrides.insert("MAX_STOP_ATR".to_string(), "2.5".to_string());
        overrides.insert("HARD_STOP".to_string(), "false".to_string());

        let loaded = load_layered(None, &overrides).unwrap();
        assert_eq!(loaded.config.max_stop_atr, 2.5);
        assert!(!loaded.config.hard_stop);
        assert_eq!(loaded.config_hash.len(), 64);
    }

    #[test]
    fn same_inputs_hash_identically() {
        let overrides = BTreeMap::new();
        let a = load_layered(None, &overrides).unwrap();
        let b = load_layered(None, &overrides).unwrap();
        assert_eq!(a.config_hash, b.config_hash);
    }

    #[test]
    fn coalescer_suppresses_repeats() {
        let mut c = WarnCoalescer::new();
        assert_eq!(c.note("gap"), CoalesceOutcome::Emit);
        assert_eq!(c.note("gap"), CoalesceOutcome::Suppressed(2));
        assert_eq!(c.note("gap"), CoalesceOutcome::Suppressed(3));
        assert_eq!(c.note("other"), CoalesceOutcome::Emit);
    }
}
