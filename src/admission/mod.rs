//! Rate limiting and IP blocking gate, evaluated before any room mutation.

use crate::audit::{AuditEvent, AuditSink, Severity};
use crate::config::AdmissionConfig;
use crate::utils::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct BlockEntry {
    pub ip_address: IpAddr,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub blocked_until: DateTime<Utc>,
}

impl BlockEntry {
    pub fn is_active(&self) -> bool {
        Utc::now() < self.blocked_until
    }
}

/// External blocklist store boundary. The core only upserts, removes and
/// reads entries; durability is the collaborator's concern.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    async fn upsert(&self, entry: BlockEntry);
    async fn remove(&self, ip: IpAddr) -> bool;
    async fn get(&self, ip: IpAddr) -> Option<BlockEntry>;
    async fn active_blocks(&self) -> Vec<BlockEntry>;
}

pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<IpAddr, BlockEntry>>,
}

impl MemoryBlockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait::async_trait]
impl BlockStore for MemoryBlockStore {
    async fn upsert(&self, entry: BlockEntry) {
        self.blocks.write().await.insert(entry.ip_address, entry);
    }

    async fn remove(&self, ip: IpAddr) -> bool {
        self.blocks.write().await.remove(&ip).is_some()
    }

    async fn get(&self, ip: IpAddr) -> Option<BlockEntry> {
        self.blocks.read().await.get(&ip).cloned()
    }

    async fn active_blocks(&self) -> Vec<BlockEntry> {
        self.blocks
            .read()
            .await
            .values()
            .filter(|e| e.is_active())
            .cloned()
            .collect()
    }
}

/// Sliding-window action counter, per IP, in memory. Entries older than the
/// window decay on the next check for that IP.
struct RateLimiter {
    window: std::time::Duration,
    max_actions: u32,
    attempts: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    fn new(config: &AdmissionConfig) -> Self {
        Self {
            window: config.rate_limit_window,
            max_actions: config.rate_limit_max_actions,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Records one attempt and reports whether the quota still holds.
    fn check_and_record(&self, ip: IpAddr, now: Instant) -> bool {
        let mut attempts = self.attempts.lock();
        let window = self.window;
        let entry = attempts.entry(ip).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= self.max_actions as usize {
            return false;
        }
        entry.push_back(now);
        true
    }

    fn forget(&self, ip: IpAddr) {
        self.attempts.lock().remove(&ip);
    }
}

pub struct AdmissionControl {
    blocks: Arc<dyn BlockStore>,
    limiter: RateLimiter,
    audit: Arc<dyn AuditSink>,
}

impl AdmissionControl {
    pub fn new(
        config: &AdmissionConfig,
        blocks: Arc<dyn BlockStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            blocks,
            limiter: RateLimiter::new(config),
            audit,
        }
    }

    /// Gate applied before a connection may touch the room registry.
    pub async fn check_connection(&self, ip: IpAddr, attempted_action: &str) -> Result<()> {
        if let Some(entry) = self.blocks.get(ip).await {
            if entry.is_active() {
                warn!("Rejected {} from blocked IP {}", attempted_action, ip);
                metrics::increment_counter!("admission_rejected_blocked");
                return Err(Error::IpBlocked(ip));
            }
        }
        if !self.limiter.check_and_record(ip, Instant::now()) {
            warn!("Rate limited {} for {}", attempted_action, ip);
            metrics::increment_counter!("admission_rejected_rate_limited");
            return Err(Error::RateLimited(ip));
        }
        Ok(())
    }

    /// Idempotent upsert; re-blocking an already blocked IP refreshes the expiry.
    pub async fn block_ip(&self, ip: IpAddr, duration_minutes: i64, reason: &str) {
        let now = Utc::now();
        let entry = BlockEntry {
            ip_address: ip,
            reason: reason.to_string(),
            blocked_at: now,
            blocked_until: now + ChronoDuration::minutes(duration_minutes),
        };
        info!("Blocking IP {} for {} minutes: {}", ip, duration_minutes, reason);
        self.blocks.upsert(entry).await;
        self.audit
            .record(
                AuditEvent::new("ip-blocked", Severity::Warning)
                    .ip(ip)
                    .details(format!("{} ({} minutes)", reason, duration_minutes)),
            )
            .await;
    }

    /// Idempotent removal; unblocking an unknown IP is a no-op.
    pub async fn unblock_ip(&self, ip: IpAddr) {
        let removed = self.blocks.remove(ip).await;
        if removed {
            self.limiter.forget(ip);
            info!("Unblocked IP {}", ip);
            self.audit
                .record(AuditEvent::new("ip-unblocked", Severity::Info).ip(ip))
                .await;
        }
    }

    pub async fn list_blocks(&self) -> Vec<BlockEntry> {
        self.blocks.active_blocks().await
    }
}
