// Bounded pool of remote API credentials
//
// Each in-flight analysis task holds exactly one credential; checkout suspends
// while all of them are leased, which caps concurrent remote calls at the pool size.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

/// Reported health of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Handle to one remote API identity
#[derive(Clone)]
pub struct Credential {
    pub index: usize,
    api_key: Arc<str>,
}

impl Credential {
    pub fn new(index: usize, api_key: impl Into<Arc<str>>) -> Self {
        Self {
            index,
            api_key: api_key.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn has_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("api_key", &mask_key(&self.api_key))
            .finish()
    }
}

fn mask_key(key: &str) -> String {
    let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if key.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", tail)
    }
}

#[derive(Debug, Default)]
struct UsageStats {
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
}

impl UsageStats {
    fn health(&self) -> KeyHealth {
        if self.consecutive_failures >= 3 {
            return KeyHealth::Unhealthy;
        }

        if let Some(last_failure) = self.last_failure {
            if last_failure.elapsed() < Duration::from_secs(60) && self.consecutive_failures > 0 {
                return KeyHealth::Degraded;
            }
        }

        KeyHealth::Healthy
    }

    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.total_requests as f64
    }
}

/// Per-credential usage report for `/health/credentials`
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
    pub index: usize,
    pub key: String,
    pub health: KeyHealth,
    pub total_requests: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub failure_rate: f64,
}

/// Fixed-size credential pool
///
/// Cheap to clone; clones share the same credentials and permits.
#[derive(Clone)]
pub struct CredentialPool {
    semaphore: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<Credential>>>,
    all: Arc<Vec<Credential>>,
    usage: Arc<RwLock<Vec<UsageStats>>>,
}

impl CredentialPool {
    /// Build a pool of exactly `size` credentials, cycling through `keys`
    pub fn new(keys: &[String], size: usize) -> Self {
        let size = size.max(1);
        if keys.is_empty() {
            warn!("No API keys configured; remote analysis calls will fail");
        }

        let credentials: Vec<Credential> = (0..size)
            .map(|i| {
                let key = if keys.is_empty() {
                    ""
                } else {
                    keys[i % keys.len()].as_str()
                };
                Credential::new(i, key)
            })
            .collect();

        info!(
            "Credential pool ready: {} handles over {} distinct keys",
            size,
            keys.len()
        );

        // Checkout pops from the back; reverse so credential 0 goes out first
        let idle: Vec<Credential> = credentials.iter().rev().cloned().collect();

        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            idle: Arc::new(Mutex::new(idle)),
            usage: Arc::new(RwLock::new((0..size).map(|_| UsageStats::default()).collect())),
            all: Arc::new(credentials),
        }
    }

    /// Borrow a credential, waiting until one is free
    pub async fn checkout(&self) -> CredentialLease {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("credential pool semaphore is never closed");

        let credential = self
            .idle
            .lock()
            .pop()
            .expect("a held permit always has an idle credential");

        trace!("Checked out credential {}", credential.index);

        CredentialLease {
            credential: Some(credential),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        }
    }

    /// Return a credential explicitly (equivalent to dropping the lease)
    pub fn release(&self, lease: CredentialLease) {
        drop(lease);
    }

    /// Total number of credentials
    pub fn size(&self) -> usize {
        self.all.len()
    }

    /// Credentials not currently leased
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.size() - self.available()
    }

    pub fn record_success(&self, index: usize) {
        let mut usage = self.usage.write();
        if let Some(stats) = usage.get_mut(index) {
            stats.consecutive_successes += 1;
            stats.consecutive_failures = 0;
            stats.total_requests += 1;

            if stats.consecutive_successes >= 5 && stats.last_failure.is_some() {
                info!(
                    "Credential {} recovered ({} consecutive successes)",
                    index, stats.consecutive_successes
                );
                stats.last_failure = None;
            }
        }
    }

    pub fn record_failure(&self, index: usize) {
        let mut usage = self.usage.write();
        if let Some(stats) = usage.get_mut(index) {
            stats.consecutive_failures += 1;
            stats.consecutive_successes = 0;
            stats.last_failure = Some(Instant::now());
            stats.total_requests += 1;
            stats.total_failures += 1;

            if stats.consecutive_failures >= 3 {
                warn!(
                    "Credential {} unhealthy ({} consecutive failures, {:.1}% overall failure rate)",
                    index,
                    stats.consecutive_failures,
                    stats.failure_rate() * 100.0
                );
            } else {
                debug!("Credential {} failure recorded", index);
            }
        }
    }

    pub fn stats(&self) -> Vec<CredentialStats> {
        let usage = self.usage.read();
        self.all
            .iter()
            .zip(usage.iter())
            .map(|(credential, stats)| CredentialStats {
                index: credential.index,
                key: mask_key(credential.api_key()),
                health: stats.health(),
                total_requests: stats.total_requests,
                total_failures: stats.total_failures,
                consecutive_failures: stats.consecutive_failures,
                failure_rate: stats.failure_rate(),
            })
            .collect()
    }

    /// Credentials that carry a key and are not failing
    pub fn healthy_count(&self) -> usize {
        let usage = self.usage.read();
        self.all
            .iter()
            .zip(usage.iter())
            .filter(|(credential, stats)| credential.has_key() && stats.health() == KeyHealth::Healthy)
            .count()
    }
}

/// Scope guard for one checked-out credential
///
/// Dropping the lease puts the credential back before its permit is released,
/// so a waiting `checkout` always finds an idle handle.
pub struct CredentialLease {
    credential: Option<Credential>,
    idle: Arc<Mutex<Vec<Credential>>>,
    _permit: OwnedSemaphorePermit,
}

impl CredentialLease {
    pub fn credential(&self) -> &Credential {
        self.credential
            .as_ref()
            .expect("lease holds its credential until dropped")
    }
}

impl std::ops::Deref for CredentialLease {
    type Target = Credential;

    fn deref(&self) -> &Credential {
        self.credential()
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if let Some(credential) = self.credential.take() {
            trace!("Released credential {}", credential.index);
            self.idle.lock().push(credential);
        }
    }
}
