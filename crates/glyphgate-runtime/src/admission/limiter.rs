//! Fixed-window request quotas with blacklist escalation.
//!
//! Check order for every request:
//! 1. whitelist-only mode rejects unknown addresses;
//! 2. blacklisted addresses are rejected before any counter moves;
//! 3. the per-address counter, where each violation raises the address's
//!    risk and enough risk blacklists it;
//! 4. the global counter.
//!
//! A limit of `-1` disables that counter and nothing is tracked for it.
//! Attempts count even when rejected. At most `max_tracked_addresses`
//! windows are kept; the least recently seen address is evicted first.

use super::AdmissionError;
use crate::descriptor::ImageSize;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests per address per window, `-1` for unlimited
    pub address_limit: i64,
    /// Requests across all addresses per window, `-1` for unlimited
    pub global_limit: i64,
    /// Per-address window length in seconds
    pub address_reset_secs: u64,
    /// Global window length in seconds
    pub global_reset_secs: u64,
    /// Violations tolerated before an address is blacklisted
    pub blacklist_trigger: Option<u32>,
    /// Plain-text blacklist, one address per line
    pub blacklist_file: Option<PathBuf>,
    /// Only admit whitelisted addresses
    pub whitelist_only: bool,
    pub whitelist: Vec<IpAddr>,
    /// Plain-text whitelist, one address per line
    pub whitelist_file: Option<PathBuf>,
    /// How often list files are re-read, in seconds
    pub list_refresh_secs: u64,
    /// Accepted image sizes such as `"100x30"`; empty admits every size
    pub allowed_sizes: Vec<String>,
    /// Upper bound on per-address windows held in memory
    pub max_tracked_addresses: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            address_limit: -1,
            global_limit: -1,
            address_reset_secs: 3600,
            global_reset_secs: 86400,
            blacklist_trigger: None,
            blacklist_file: None,
            whitelist_only: false,
            whitelist: Vec::new(),
            whitelist_file: None,
            list_refresh_secs: 60,
            allowed_sizes: Vec::new(),
            max_tracked_addresses: RateLimitConfig::DEFAULT_MAX_TRACKED_ADDRESSES,
        }
    }
}

impl RateLimitConfig {
    const DEFAULT_MAX_TRACKED_ADDRESSES: usize = 10_000;

    pub fn is_unlimited(&self) -> bool {
        self.address_limit < 0 && self.global_limit < 0
    }
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Proof that a request was counted; pass it back to
/// [`RateLimiter::release`] to refund the attempt.
#[derive(Debug)]
#[must_use]
pub struct QuotaTicket {
    address: IpAddr,
}

impl QuotaTicket {
    pub fn address(&self) -> IpAddr {
        self.address
    }
}

#[derive(Debug, Clone, Copy)]
struct AddressWindow {
    count: u64,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    address_counts: Mutex<FxHashMap<IpAddr, AddressWindow>>,
    global_count: AtomicU64,
    risk: Mutex<FxHashMap<IpAddr, u32>>,
    /// Addresses blacklisted by escalation, kept across file refreshes
    escalated: Mutex<FxHashSet<IpAddr>>,
    blacklist: RwLock<FxHashSet<IpAddr>>,
    whitelist: RwLock<FxHashSet<IpAddr>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let whitelist = config.whitelist.iter().copied().collect();
        Self {
            config,
            address_counts: Mutex::new(FxHashMap::default()),
            global_count: AtomicU64::new(0),
            risk: Mutex::new(FxHashMap::default()),
            escalated: Mutex::new(FxHashSet::default()),
            blacklist: RwLock::new(FxHashSet::default()),
            whitelist: RwLock::new(whitelist),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one attempt from `address`.
    pub fn acquire(&self, address: IpAddr) -> Result<QuotaTicket, AdmissionError> {
        if self.config.whitelist_only && !self.is_whitelisted(address) {
            return Err(AdmissionError::NotWhitelisted);
        }
        if self.is_blacklisted(address) {
            return Err(AdmissionError::Blacklisted);
        }

        if self.config.address_limit >= 0 {
            let count = self.count_address(address);
            if exceeds(count, self.config.address_limit) {
                self.record_violation(address);
                return Err(AdmissionError::AddressQuotaExceeded);
            }
        }

        let global = self.global_count.fetch_add(1, Ordering::SeqCst) + 1;
        if exceeds(global, self.config.global_limit) {
            debug!(%address, global, "Global quota exceeded");
            return Err(AdmissionError::GlobalQuotaExceeded);
        }

        Ok(QuotaTicket { address })
    }

    fn count_address(&self, address: IpAddr) -> u64 {
        let now = Instant::now();
        let mut counts = self.address_counts.lock().unwrap_or_else(PoisonError::into_inner);

        if !counts.contains_key(&address) && counts.len() >= self.config.max_tracked_addresses {
            let oldest = counts
                .iter()
                .min_by_key(|(_, w)| w.last_seen)
                .map(|(ip, _)| *ip);
            if let Some(evicted) = oldest {
                counts.remove(&evicted);
                debug!(%evicted, "Evicted least recently seen address window");
            }
        }

        let window = counts.entry(address).or_insert(AddressWindow {
            count: 0,
            last_seen: now,
        });
        window.count += 1;
        window.last_seen = now;
        window.count
    }

    /// Refund a counted attempt.
    pub fn release(&self, ticket: QuotaTicket) {
        let mut counts = self.address_counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(window) = counts.get_mut(&ticket.address) {
            window.count = window.count.saturating_sub(1);
        }
        drop(counts);
        let _ = self
            .global_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |g| Some(g.saturating_sub(1)));
    }

    fn record_violation(&self, address: IpAddr) {
        let Some(trigger) = self.config.blacklist_trigger else {
            return;
        };
        let risk = {
            let mut risk = self.risk.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = risk.entry(address).or_insert(0);
            *entry += 1;
            *entry
        };
        if risk > trigger {
            self.escalated
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(address);
            self.blacklist
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(address);
            warn!(%address, risk, "Address blacklisted after repeated quota violations");
        }
    }

    pub fn reset_addresses(&self) {
        self.address_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn reset_global(&self) {
        self.global_count.store(0, Ordering::SeqCst);
    }

    pub fn address_count(&self, address: IpAddr) -> u64 {
        self.address_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .map_or(0, |w| w.count)
    }

    /// Number of per-address windows currently held.
    pub fn tracked_addresses(&self) -> usize {
        self.address_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn global_count(&self) -> u64 {
        self.global_count.load(Ordering::SeqCst)
    }

    pub fn risk_of(&self, address: IpAddr) -> u32 {
        self.risk
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    // =========================================================================
    // Black / white lists
    // =========================================================================

    pub fn is_blacklisted(&self, address: IpAddr) -> bool {
        self.blacklist
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&address)
    }

    pub fn is_whitelisted(&self, address: IpAddr) -> bool {
        self.whitelist
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&address)
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forget every blacklist entry and accumulated risk.
    pub fn clear_blacklist(&self) {
        self.escalated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.risk.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.blacklist
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Replace the file-backed blacklist, keeping escalated addresses.
    pub fn replace_blacklist(&self, entries: FxHashSet<IpAddr>) {
        let mut merged = entries;
        merged.extend(
            self.escalated
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied(),
        );
        *self.blacklist.write().unwrap_or_else(PoisonError::into_inner) = merged;
    }

    /// Replace the whitelist; configured static entries are kept.
    pub fn replace_whitelist(&self, entries: FxHashSet<IpAddr>) {
        let mut merged = entries;
        merged.extend(self.config.whitelist.iter().copied());
        *self.whitelist.write().unwrap_or_else(PoisonError::into_inner) = merged;
    }

    /// Re-read the configured list files.
    pub fn refresh_lists(&self) -> std::io::Result<()> {
        if let Some(path) = &self.config.blacklist_file {
            self.replace_blacklist(read_address_list(path)?);
        }
        if let Some(path) = &self.config.whitelist_file {
            self.replace_whitelist(read_address_list(path)?);
        }
        Ok(())
    }
}

fn exceeds(count: u64, limit: i64) -> bool {
    limit >= 0 && count > limit as u64
}

/// Parse an address list: one address per line, `#` starts a comment.
/// Unparseable lines are skipped with a warning.
pub fn read_address_list(path: &Path) -> std::io::Result<FxHashSet<IpAddr>> {
    let content = std::fs::read_to_string(path)?;
    let mut set = FxHashSet::default();
    for (lineno, line) in content.lines().enumerate() {
        let entry = line.split('#').next().unwrap_or("").trim();
        if entry.is_empty() {
            continue;
        }
        match entry.parse::<IpAddr>() {
            Ok(addr) => {
                set.insert(addr);
            }
            Err(_) => warn!(
                "Skipping invalid address '{}' at {}:{}",
                entry,
                path.display(),
                lineno + 1
            ),
        }
    }
    Ok(set)
}

// =============================================================================
// Size allowlist
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct SizeAllowlist {
    sizes: FxHashSet<String>,
}

impl SizeAllowlist {
    pub fn new<S: AsRef<str>>(sizes: &[S]) -> Self {
        Self {
            sizes: sizes.iter().map(|s| s.as_ref().trim().to_string()).collect(),
        }
    }

    pub fn check(&self, size: &ImageSize) -> Result<(), AdmissionError> {
        let key = size.to_string();
        if self.sizes.is_empty() || self.sizes.contains(&key) {
            Ok(())
        } else {
            Err(AdmissionError::ImageSizeNotAllowed(key))
        }
    }
}

// =============================================================================
// Maintenance jobs
// =============================================================================

fn spawn_every(period: Duration, name: &'static str, job: impl Fn() + Send + 'static) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // Skip the immediate first tick
        interval.tick().await;
        loop {
            interval.tick().await;
            debug!("{} fired", name);
            job();
        }
    })
}

/// Spawn the window reset jobs and, when list files are configured, the
/// refresh job. Lists are loaded once before returning.
pub fn spawn_maintenance(limiter: Arc<RateLimiter>) -> Vec<JoinHandle<()>> {
    let config = limiter.config().clone();
    let mut handles = Vec::new();

    if config.address_limit >= 0 && config.address_reset_secs > 0 {
        let l = limiter.clone();
        handles.push(spawn_every(
            Duration::from_secs(config.address_reset_secs),
            "address quota reset",
            move || l.reset_addresses(),
        ));
    }
    if config.global_limit >= 0 && config.global_reset_secs > 0 {
        let l = limiter.clone();
        handles.push(spawn_every(
            Duration::from_secs(config.global_reset_secs),
            "global quota reset",
            move || l.reset_global(),
        ));
    }

    if config.blacklist_file.is_some() || config.whitelist_file.is_some() {
        if let Err(e) = limiter.refresh_lists() {
            warn!("Failed to load address lists: {}", e);
        }
        if config.list_refresh_secs > 0 {
            let l = limiter.clone();
            handles.push(spawn_every(
                Duration::from_secs(config.list_refresh_secs),
                "address list refresh",
                move || match l.refresh_lists() {
                    Ok(()) => debug!("Address lists refreshed"),
                    Err(e) => warn!("Failed to refresh address lists: {}", e),
                },
            ));
        }
        info!(
            blacklisted = limiter.blacklist_len(),
            "Address lists loaded"
        );
    }

    handles
}
