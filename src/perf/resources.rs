//! Tracked-resource registry and leak detection
//!
//! Any closeable resource (connection, statement, cursor, buffer) can be
//! registered here with its estimated size. A resource whose age and idle
//! time both exceed the leak threshold is flagged with a severity score in
//! [0,1]; only high-severity leaks (> 0.7) are cleaned up, so a resource
//! that is merely old but still in use is never destroyed mid-flight.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Kind of tracked resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Connection,
    Statement,
    Cursor,
    Buffer,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Connection => "connection",
            ResourceKind::Statement => "statement",
            ResourceKind::Cursor => "cursor",
            ResourceKind::Buffer => "buffer",
        }
    }
}

/// Bookkeeping for one tracked resource
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub id: u64,
    pub kind: ResourceKind,
    pub created_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub size_bytes: u64,
}

impl ResourceInfo {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_access.elapsed()
    }
}

/// A flagged leak candidate
#[derive(Debug, Clone)]
pub struct ResourceLeak {
    pub resource: ResourceInfo,
    pub severity: f64,
}

/// Severity shares: age and idle contribute up to 0.4 each, size up to 0.2.
/// Full share is reached at 4x the leak threshold (age/idle) and at
/// `SIZE_REFERENCE_BYTES` (size). Monotonically non-decreasing in all three.
const AGE_SHARE: f64 = 0.4;
const IDLE_SHARE: f64 = 0.4;
const SIZE_SHARE: f64 = 0.2;
const FULL_SHARE_MULTIPLIER: f64 = 4.0;
const SIZE_REFERENCE_BYTES: f64 = 10.0 * 1024.0 * 1024.0;

/// Severity above which a leak is closed by cleanup
pub const CLEANUP_SEVERITY: f64 = 0.7;

/// Registry of closeable resources with leak scoring
#[derive(Debug)]
pub struct ResourceManager {
    leak_age_threshold: Duration,
    resources: HashMap<u64, ResourceInfo>,
    next_id: u64,
    total_registered: u64,
    total_leaked: u64,
}

impl ResourceManager {
    pub fn new(leak_age_threshold: Duration) -> Self {
        Self {
            leak_age_threshold,
            resources: HashMap::new(),
            next_id: 1,
            total_registered: 0,
            total_leaked: 0,
        }
    }

    /// Track a resource, returning its handle id
    pub fn register(&mut self, kind: ResourceKind, size_bytes: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.total_registered += 1;
        let now = Instant::now();
        self.resources.insert(
            id,
            ResourceInfo {
                id,
                kind,
                created_at: now,
                last_access: now,
                access_count: 0,
                size_bytes,
            },
        );
        id
    }

    /// Record an access, refreshing the idle clock
    pub fn touch(&mut self, id: u64) {
        if let Some(resource) = self.resources.get_mut(&id) {
            resource.last_access = Instant::now();
            resource.access_count += 1;
        }
    }

    pub fn unregister(&mut self, id: u64) -> Option<ResourceInfo> {
        self.resources.remove(&id)
    }

    pub fn tracked(&self) -> usize {
        self.resources.len()
    }

    pub fn total_leaked(&self) -> u64 {
        self.total_leaked
    }

    fn severity(&self, resource: &ResourceInfo) -> f64 {
        let threshold = self.leak_age_threshold.as_secs_f64().max(f64::EPSILON);
        let age_ratio = resource.age().as_secs_f64() / threshold;
        let idle_ratio = resource.idle().as_secs_f64() / threshold;
        let age_score = AGE_SHARE * (age_ratio / FULL_SHARE_MULTIPLIER).min(1.0);
        let idle_score = IDLE_SHARE * (idle_ratio / FULL_SHARE_MULTIPLIER).min(1.0);
        let size_score = SIZE_SHARE * (resource.size_bytes as f64 / SIZE_REFERENCE_BYTES).min(1.0);
        (age_score + idle_score + size_score).min(1.0)
    }

    /// Flag resources whose age and idle time both exceed the threshold
    pub fn detect_leaks(&self) -> Vec<ResourceLeak> {
        let mut leaks: Vec<ResourceLeak> = self
            .resources
            .values()
            .filter(|r| r.age() > self.leak_age_threshold && r.idle() > self.leak_age_threshold)
            .map(|r| ResourceLeak {
                resource: r.clone(),
                severity: self.severity(r),
            })
            .collect();
        leaks.sort_by(|a, b| {
            b.severity
                .partial_cmp(&a.severity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        leaks
    }

    /// Close and unregister only high-severity leaks, returning what was
    /// removed. Lower-severity candidates stay tracked so a resource still
    /// in occasional use is not destroyed.
    pub fn cleanup_leaked(&mut self) -> Vec<ResourceLeak> {
        let victims: Vec<ResourceLeak> = self
            .detect_leaks()
            .into_iter()
            .filter(|leak| leak.severity > CLEANUP_SEVERITY)
            .collect();
        for leak in &victims {
            self.resources.remove(&leak.resource.id);
            self.total_leaked += 1;
            warn!(
                resource_id = leak.resource.id,
                kind = leak.resource.kind.as_str(),
                severity = leak.severity,
                age_ms = leak.resource.age().as_millis() as u64,
                "closed leaked resource"
            );
        }
        if !victims.is_empty() {
            debug!(removed = victims.len(), remaining = self.resources.len(), "leak cleanup pass");
        }
        victims
    }

    pub fn set_leak_age_threshold(&mut self, threshold: Duration) {
        self.leak_age_threshold = threshold;
    }
}
