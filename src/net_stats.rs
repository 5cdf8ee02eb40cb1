//! Per-NIC traffic accounting with durable on-disk persistence.
//!
//! Byte counters are sampled every `detect_interval` seconds into an
//! in-memory cache of deltas; every `save_interval` seconds the cache is
//! rolled up into one datum per NIC, expired data is purged and the whole
//! store is written to disk (write to `.tmp`, atomic rename). All reads
//! return deep copies so callers never hold the lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sysinfo::Networks;
use time::{Date, Month, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_PRESERVE_DAYS: f64 = 31.0;
pub const DEFAULT_DETECT_INTERVAL: f64 = 2.0;
pub const DEFAULT_SAVE_INTERVAL: f64 = 600.0;
pub const DEFAULT_STORE_PATH: &str = "./net_static.json";

/// One sampled delta: bytes transmitted/received since the previous sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficDatum {
    pub timestamp: u64,
    pub tx: u64,
    pub rx: u64,
}

/// Aggregated totals over a query window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotal {
    pub tx: u64,
    pub rx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub data_preserve_day: f64,
    pub detect_interval: f64,
    pub save_interval: f64,
    /// Monitored NICs; empty means all.
    #[serde(default)]
    pub nics: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_preserve_day: DEFAULT_PRESERVE_DAYS,
            detect_interval: DEFAULT_DETECT_INTERVAL,
            save_interval: DEFAULT_SAVE_INTERVAL,
            nics: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// Zero-valued intervals fall back to the defaults (a loaded file may
    /// predate a config field).
    fn or_default(mut self) -> Self {
        if self.data_preserve_day == 0.0 {
            self.data_preserve_day = DEFAULT_PRESERVE_DAYS;
        }
        if self.detect_interval == 0.0 {
            self.detect_interval = DEFAULT_DETECT_INTERVAL;
        }
        if self.save_interval == 0.0 {
            self.save_interval = DEFAULT_SAVE_INTERVAL;
        }
        self
    }
}

/// Partial config update. `None` keeps the current value; for `nics`,
/// `Some(vec![])` switches to monitoring all interfaces.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub data_preserve_day: Option<f64>,
    pub detect_interval: Option<f64>,
    pub save_interval: Option<f64>,
    pub nics: Option<Vec<String>>,
}

/// The on-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetStatic {
    #[serde(default)]
    pub interfaces: HashMap<String, Vec<TrafficDatum>>,
    #[serde(default)]
    pub config: Option<StoreConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicReading {
    pub tx: u64,
    pub rx: u64,
}

#[derive(Default)]
struct Inner {
    interfaces: HashMap<String, Vec<TrafficDatum>>,
    config: StoreConfig,
    /// Deltas not yet rolled up into `interfaces`.
    cache: HashMap<String, Vec<TrafficDatum>>,
    /// Last observed cumulative counters, per NIC.
    last: HashMap<String, NicReading>,
    running: bool,
}

pub struct TrafficStore {
    path: PathBuf,
    inner: RwLock<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// `c - p`, treating counter wrap or interface reset as zero.
pub fn safe_delta(current: u64, previous: u64) -> u64 {
    current.saturating_sub(previous)
}

fn now_unix() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

fn is_nic_allowed(nics: &[String], name: &str) -> bool {
    nics.is_empty() || nics.iter().any(|n| n == name)
}

impl TrafficStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(Inner::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load history from disk (if any) and start the sampling and flush
    /// loops. Idempotent: calling on a running store is a no-op.
    pub fn start_or_continue(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.write().expect("traffic store lock");
            if inner.running {
                return Ok(());
            }
            load_from_file(&self.path, &mut inner)?;
            inner.running = true;
        }

        let sampler = {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    let interval = store.detect_interval();
                    tokio::time::sleep(std::time::Duration::from_secs_f64(interval)).await;
                    let readings = kernel_counters();
                    store.record_sample(&readings, now_unix());
                }
            })
        };
        let flusher = {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    let interval = store.save_interval();
                    tokio::time::sleep(std::time::Duration::from_secs_f64(interval)).await;
                    store.flush(now_unix());
                }
            })
        };
        self.tasks
            .lock()
            .expect("traffic store tasks lock")
            .extend([sampler, flusher]);
        Ok(())
    }

    fn detect_interval(&self) -> f64 {
        self.inner
            .read()
            .expect("traffic store lock")
            .config
            .detect_interval
    }

    fn save_interval(&self) -> f64 {
        self.inner
            .read()
            .expect("traffic store lock")
            .config
            .save_interval
    }

    /// Fold one round of cumulative counter readings into the cache. The
    /// first observation of a NIC only establishes its baseline.
    pub fn record_sample(&self, readings: &[(String, NicReading)], now: u64) {
        let mut inner = self.inner.write().expect("traffic store lock");
        for (name, reading) in readings {
            if !is_nic_allowed(&inner.config.nics, name) {
                continue;
            }
            if let Some(prev) = inner.last.get(name).copied() {
                let tx = safe_delta(reading.tx, prev.tx);
                let rx = safe_delta(reading.rx, prev.rx);
                if tx > 0 || rx > 0 {
                    inner.cache.entry(name.clone()).or_default().push(TrafficDatum {
                        timestamp: now,
                        tx,
                        rx,
                    });
                }
            }
            inner.last.insert(name.clone(), *reading);
        }
    }

    /// Roll the cache up into the persistent sequences, purge expired data
    /// and write the store to disk. Write failures keep state in memory and
    /// are retried on the next flush.
    pub fn flush(&self, now: u64) {
        let mut inner = self.inner.write().expect("traffic store lock");
        roll_up_cache(&mut inner, now);
        purge_expired(&mut inner, now);
        if let Err(e) = save_to_file(&self.path, &inner) {
            warn!("traffic store save failed (will retry next flush): {e:#}");
        }
    }

    /// Stop the loops and persist a final snapshot.
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("traffic store tasks lock").drain(..) {
            task.abort();
        }
        let mut inner = self.inner.write().expect("traffic store lock");
        if !inner.running {
            return;
        }
        inner.running = false;
        let now = now_unix();
        roll_up_cache(&mut inner, now);
        purge_expired(&mut inner, now);
        if let Err(e) = save_to_file(&self.path, &inner) {
            warn!("traffic store final save failed: {e:#}");
        }
    }

    /// Drop all recorded data and baselines. Persisted on the next flush.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("traffic store lock");
        inner.interfaces.clear();
        inner.cache.clear();
        inner.last.clear();
    }

    /// Replace the persistent record wholesale. Expired entries are purged
    /// immediately; the next flush persists.
    pub fn force_replace(&self, interfaces: HashMap<String, Vec<TrafficDatum>>) {
        let mut inner = self.inner.write().expect("traffic store lock");
        inner.interfaces = interfaces;
        let now = now_unix();
        purge_expired(&mut inner, now);
    }

    /// Merge a partial config update. When a non-empty whitelist becomes
    /// effective, cache and baseline entries for other NICs are dropped so a
    /// later re-inclusion cannot produce a giant delta.
    pub fn set_config(&self, patch: ConfigPatch) {
        let mut inner = self.inner.write().expect("traffic store lock");
        if let Some(v) = patch.data_preserve_day {
            inner.config.data_preserve_day = v;
        }
        if let Some(v) = patch.detect_interval {
            inner.config.detect_interval = v;
        }
        if let Some(v) = patch.save_interval {
            inner.config.save_interval = v;
        }
        if let Some(nics) = patch.nics {
            inner.config.nics = nics;
            if !inner.config.nics.is_empty() {
                let allowed: Vec<String> = inner.config.nics.clone();
                inner.last.retain(|name, _| is_nic_allowed(&allowed, name));
                inner.cache.retain(|name, _| is_nic_allowed(&allowed, name));
            }
        }
        inner.config = inner.config.clone().or_default();
        let now = now_unix();
        purge_expired(&mut inner, now);
        if let Err(e) = save_to_file(&self.path, &inner) {
            warn!("traffic store save failed after config change: {e:#}");
        }
    }

    /// Summed deltas per NIC with `start <= timestamp <= end`, cache
    /// included. A `0` bound means unbounded on that side.
    pub fn total_between(&self, start: u64, end: u64) -> HashMap<String, TrafficTotal> {
        let inner = self.inner.read().expect("traffic store lock");
        let in_range = |ts: u64| (start == 0 || ts >= start) && (end == 0 || ts <= end);
        let mut totals: HashMap<String, TrafficTotal> = HashMap::new();
        for (name, data) in inner.interfaces.iter().chain(inner.cache.iter()) {
            let mut sum = TrafficTotal::default();
            for d in data.iter().filter(|d| in_range(d.timestamp)) {
                sum.tx += d.tx;
                sum.rx += d.rx;
            }
            if sum.tx > 0 || sum.rx > 0 {
                let entry = totals.entry(name.clone()).or_default();
                entry.tx += sum.tx;
                entry.rx += sum.rx;
            }
        }
        totals
    }

    /// Deep copy of the current store contents (persistent data plus the
    /// unflushed cache) and effective config.
    pub fn snapshot(&self) -> NetStatic {
        let inner = self.inner.read().expect("traffic store lock");
        let mut interfaces = inner.interfaces.clone();
        for (name, data) in &inner.cache {
            interfaces.entry(name.clone()).or_default().extend(data.iter().copied());
        }
        NetStatic {
            interfaces,
            config: Some(inner.config.clone()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn roll_up_cache(inner: &mut Inner, now: u64) {
    let cache = std::mem::take(&mut inner.cache);
    for (name, data) in cache {
        let (tx, rx) = data
            .iter()
            .fold((0u64, 0u64), |(tx, rx), d| (tx + d.tx, rx + d.rx));
        if tx > 0 || rx > 0 {
            inner.interfaces.entry(name).or_default().push(TrafficDatum {
                timestamp: now,
                tx,
                rx,
            });
        }
    }
}

fn purge_expired(inner: &mut Inner, now: u64) {
    let ttl = (inner.config.data_preserve_day * 86_400.0) as u64;
    let cutoff = now.saturating_sub(ttl);
    inner.interfaces.retain(|_, data| {
        data.retain(|d| d.timestamp >= cutoff);
        !data.is_empty()
    });
}

fn load_from_file(path: &Path, inner: &mut Inner) -> Result<()> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    if data.is_empty() {
        return Ok(());
    }
    match serde_json::from_slice::<NetStatic>(&data) {
        Ok(loaded) => {
            inner.interfaces = loaded.interfaces;
            inner.config = loaded.config.unwrap_or_default().or_default();
            purge_expired(inner, now_unix());
        }
        Err(e) => {
            // A corrupt file must never block startup: keep it aside and
            // begin empty.
            let backup = path.with_extension("json.bak");
            warn!(
                "corrupt traffic store {} ({e}), moved to {}",
                path.display(),
                backup.display()
            );
            let _ = std::fs::rename(path, backup);
        }
    }
    Ok(())
}

fn save_to_file(path: &Path, inner: &Inner) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let doc = NetStatic {
        interfaces: inner.interfaces.clone(),
        config: Some(inner.config.clone()),
    };
    // Compact on purpose: the file is machine-read only.
    let bytes = serde_json::to_vec(&doc).context("serializing traffic store")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    debug!("traffic store saved to {}", path.display());
    Ok(())
}

/// Read cumulative byte counters for every kernel interface.
pub fn kernel_counters() -> Vec<(String, NicReading)> {
    let networks = Networks::new_with_refreshed_list();
    networks
        .iter()
        .map(|(name, data)| {
            (
                name.to_string(),
                NicReading {
                    tx: data.total_transmitted(),
                    rx: data.total_received(),
                },
            )
        })
        .collect()
}

/// Most recent reset instant at or before `now` for a monthly reset on
/// `reset_day`. When a month lacks that day the reset rolls forward to the
/// first of the following month. Out-of-range days return `now` unchanged.
pub fn last_reset_date(reset_day: u8, now: OffsetDateTime) -> OffsetDateTime {
    if !(1..=31).contains(&reset_day) {
        return now;
    }
    let this_month = actual_reset_date(now.year(), now.month(), reset_day);
    if now >= this_month {
        return this_month;
    }
    let (prev_year, prev_month) = match now.month() {
        Month::January => (now.year() - 1, Month::December),
        m => (now.year(), m.previous()),
    };
    actual_reset_date(prev_year, prev_month, reset_day)
}

fn actual_reset_date(year: i32, month: Month, reset_day: u8) -> OffsetDateTime {
    let days = time::util::days_in_year_month(year, month);
    let date = if reset_day <= days {
        Date::from_calendar_date(year, month, reset_day)
    } else {
        // Roll forward: the month has no such day.
        let (next_year, next_month) = match month {
            Month::December => (year + 1, Month::January),
            m => (year, m.next()),
        };
        Date::from_calendar_date(next_year, next_month, 1)
    };
    date.expect("valid calendar date").midnight().assume_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading(tx: u64, rx: u64) -> NicReading {
        NicReading { tx, rx }
    }

    #[test]
    fn safe_delta_handles_wrap_and_reset() {
        assert_eq!(safe_delta(100, 40), 60);
        assert_eq!(safe_delta(40, 100), 0);
        assert_eq!(safe_delta(50, u32::MAX as u64 - 100), 0);
        assert_eq!(safe_delta(0, 0), 0);
    }

    #[test]
    fn first_observation_is_baseline_only() {
        let store = TrafficStore::new("/nonexistent/never-written.json");
        store.record_sample(&[("eth0".into(), reading(1000, 2000))], 10);
        assert!(store.total_between(0, 0).is_empty());

        store.record_sample(&[("eth0".into(), reading(1500, 2600))], 12);
        let totals = store.total_between(0, 0);
        assert_eq!(totals["eth0"], TrafficTotal { tx: 500, rx: 600 });
    }

    #[test]
    fn counter_wrap_appends_nothing() {
        let store = TrafficStore::new("/nonexistent/never-written.json");
        store.record_sample(&[("eth0".into(), reading((1u64 << 32) - 100, 0))], 10);
        store.record_sample(&[("eth0".into(), reading(50, 0))], 12);
        // No ~4 GiB spike: both deltas coerce to zero, so no datum at all.
        assert!(store.total_between(0, 0).is_empty());

        // The wrapped reading became the new baseline.
        store.record_sample(&[("eth0".into(), reading(80, 0))], 14);
        assert_eq!(
            store.total_between(0, 0)["eth0"],
            TrafficTotal { tx: 30, rx: 0 }
        );
    }

    #[test]
    fn whitelist_restricts_recorded_nics() {
        let store = TrafficStore::new("/nonexistent/never-written.json");
        store.set_config(ConfigPatch {
            nics: Some(vec!["eth0".into()]),
            ..ConfigPatch::default()
        });
        for name in ["eth0", "docker0"] {
            store.record_sample(&[(name.into(), reading(100, 100))], 10);
            store.record_sample(&[(name.into(), reading(300, 400))], 12);
        }
        let totals = store.total_between(0, 0);
        assert_eq!(totals.len(), 1);
        assert_eq!(totals["eth0"], TrafficTotal { tx: 200, rx: 300 });

        let snap = store.snapshot();
        for name in snap.interfaces.keys() {
            assert_eq!(name, "eth0");
        }
    }

    #[test]
    fn set_config_none_keeps_whitelist_empty_means_all() {
        let store = TrafficStore::new("/nonexistent/never-written.json");
        store.set_config(ConfigPatch {
            nics: Some(vec!["eth0".into()]),
            ..ConfigPatch::default()
        });
        // None: unchanged.
        store.set_config(ConfigPatch::default());
        assert_eq!(store.snapshot().config.unwrap().nics, vec!["eth0"]);
        // Empty vec: monitor all.
        store.set_config(ConfigPatch {
            nics: Some(Vec::new()),
            ..ConfigPatch::default()
        });
        assert!(store.snapshot().config.unwrap().nics.is_empty());
    }

    #[test]
    fn whitelist_purges_stray_baselines() {
        let store = TrafficStore::new("/nonexistent/never-written.json");
        store.record_sample(&[("docker0".into(), reading(100, 100))], 10);
        store.set_config(ConfigPatch {
            nics: Some(vec!["eth0".into()]),
            ..ConfigPatch::default()
        });
        // Re-allowing docker0 later must re-baseline, not produce a delta
        // against the stale counter.
        store.set_config(ConfigPatch {
            nics: Some(Vec::new()),
            ..ConfigPatch::default()
        });
        store.record_sample(&[("docker0".into(), reading(9000, 9000))], 20);
        assert!(store.total_between(0, 0).is_empty());
    }

    #[test]
    fn flush_rolls_cache_into_single_datum_and_purges() {
        let store = TrafficStore::new("/nonexistent/never-written.json");
        let day = 86_400u64;
        let now = 100 * day;
        store.record_sample(&[("eth0".into(), reading(0, 0))], now - 30);
        store.record_sample(&[("eth0".into(), reading(10, 20))], now - 20);
        store.record_sample(&[("eth0".into(), reading(30, 50))], now - 10);
        store.flush(now);

        let snap = store.snapshot();
        let data = &snap.interfaces["eth0"];
        assert_eq!(data.len(), 1);
        assert_eq!(
            data[0],
            TrafficDatum {
                timestamp: now,
                tx: 30,
                rx: 50
            }
        );
    }

    #[test]
    fn flush_drops_expired_data() {
        let store = TrafficStore::new("/nonexistent/never-written.json");
        let day = 86_400u64;
        let now = 100 * day;
        let old = now - 32 * day;
        store.force_replace(HashMap::from([(
            "eth0".to_string(),
            vec![
                TrafficDatum {
                    timestamp: old,
                    tx: 1,
                    rx: 1,
                },
                TrafficDatum {
                    timestamp: now - day,
                    tx: 2,
                    rx: 2,
                },
            ],
        )]));
        store.flush(now);
        let snap = store.snapshot();
        let data = &snap.interfaces["eth0"];
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].timestamp, now - day);
    }

    #[test]
    fn total_between_is_inclusive_with_zero_sentinels() {
        let store = TrafficStore::new("/nonexistent/never-written.json");
        store.force_replace(HashMap::from([(
            "eth0".to_string(),
            vec![
                TrafficDatum {
                    timestamp: now_unix() - 30,
                    tx: 1,
                    rx: 10,
                },
                TrafficDatum {
                    timestamp: now_unix() - 20,
                    tx: 2,
                    rx: 20,
                },
                TrafficDatum {
                    timestamp: now_unix() - 10,
                    tx: 4,
                    rx: 40,
                },
            ],
        )]));
        let now = now_unix();
        // Inclusive at both ends.
        let t = store.total_between(now - 30, now - 10);
        assert_eq!(t["eth0"], TrafficTotal { tx: 7, rx: 70 });
        let t = store.total_between(now - 20, now - 20);
        assert_eq!(t["eth0"], TrafficTotal { tx: 2, rx: 20 });
        // Zero means unbounded.
        let t = store.total_between(0, now - 20);
        assert_eq!(t["eth0"], TrafficTotal { tx: 3, rx: 30 });
        let t = store.total_between(now - 20, 0);
        assert_eq!(t["eth0"], TrafficTotal { tx: 6, rx: 60 });
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let store = TrafficStore::new("/nonexistent/never-written.json");
        store.force_replace(HashMap::from([(
            "eth0".to_string(),
            vec![TrafficDatum {
                timestamp: now_unix(),
                tx: 5,
                rx: 5,
            }],
        )]));
        let mut snap = store.snapshot();
        snap.interfaces.get_mut("eth0").unwrap().clear();
        snap.interfaces.insert("bogus".into(), Vec::new());
        let again = store.snapshot();
        assert_eq!(again.interfaces["eth0"].len(), 1);
        assert!(!again.interfaces.contains_key("bogus"));
    }

    #[test]
    fn reset_date_mid_month_boundaries() {
        // Day 15: before the 15th the window starts in the previous month.
        assert_eq!(
            last_reset_date(15, datetime!(2024-03-10 12:00:00 UTC)),
            datetime!(2024-02-15 00:00:00 UTC)
        );
        assert_eq!(
            last_reset_date(15, datetime!(2024-03-20 12:00:00 UTC)),
            datetime!(2024-03-15 00:00:00 UTC)
        );
    }

    #[test]
    fn reset_date_rolls_forward_when_month_is_short() {
        // April has 30 days, so a day-31 reset falls on May 1.
        assert_eq!(
            last_reset_date(31, datetime!(2024-05-15 00:00:00 UTC)),
            datetime!(2024-05-01 00:00:00 UTC)
        );
        // February in a non-leap year: day 30 resets on March 1.
        assert_eq!(
            last_reset_date(30, datetime!(2023-03-15 00:00:00 UTC)),
            datetime!(2023-03-01 00:00:00 UTC)
        );
    }

    #[test]
    fn reset_date_on_the_boundary_instant() {
        // Exactly midnight on the reset day belongs to the new window.
        assert_eq!(
            last_reset_date(1, datetime!(2024-03-01 00:00:00 UTC)),
            datetime!(2024-03-01 00:00:00 UTC)
        );
    }

    #[test]
    fn reset_date_is_monotone_in_now() {
        let days: Vec<OffsetDateTime> = (1..=28)
            .map(|d| {
                datetime!(2024-01-01 06:00:00 UTC) + time::Duration::days(d as i64 * 5)
            })
            .collect();
        for reset_day in [1u8, 15, 28, 31] {
            let mut prev = last_reset_date(reset_day, days[0]);
            for now in &days[1..] {
                let cur = last_reset_date(reset_day, *now);
                assert!(cur >= prev, "reset_day={reset_day} now={now}");
                prev = cur;
            }
        }
    }

    #[test]
    fn reset_date_january_looks_back_to_december() {
        assert_eq!(
            last_reset_date(20, datetime!(2024-01-05 00:00:00 UTC)),
            datetime!(2023-12-20 00:00:00 UTC)
        );
    }
}
