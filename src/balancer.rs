//! # Client-Side Load Balancer
//!
//! Weighted round-robin endpoint selection per logical service name, with
//! broken-endpoint quarantine and hot config reload on file mtime change
//! (spec §4.6). No single teacher file does load balancing — this module
//! is assembled from the pack's background-loop idiom
//! (`coordination.rs`'s `tokio::time::sleep`-driven retry loops) and
//! `dashmap`/`parking_lot` for the concurrent broken-endpoint set and the
//! atomically swapped weighted-list snapshot.

use crate::config::BalancerConfig;
use crate::error::{RpcError, RpcResult};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

/// Weights outside this range are clamped, per spec §3.
const MIN_WEIGHT: u32 = 1;
const MAX_WEIGHT: u32 = 100;

/// Per-service rotation state: a shuffled repetition list standing in for
/// weighted selection, a round-robin cursor, and the set of endpoints
/// currently believed unreachable.
struct ServiceState {
    weighted: RwLock<Vec<String>>,
    cursor: AtomicUsize,
    broken: DashSet<String>,
}

impl ServiceState {
    fn new(weighted: Vec<String>) -> Self {
        Self {
            weighted: RwLock::new(weighted),
            cursor: AtomicUsize::new(0),
            broken: DashSet::new(),
        }
    }
}

/// Expand a `{endpoint: weight}` map into a shuffled repetition list: each
/// endpoint appears `weight.clamp(1, 100)` times.
fn expand_weights(endpoints: &std::collections::BTreeMap<String, u32>) -> Vec<String> {
    let mut list = Vec::new();
    for (endpoint, weight) in endpoints {
        let reps = (*weight).clamp(MIN_WEIGHT, MAX_WEIGHT);
        for _ in 0..reps {
            list.push(endpoint.clone());
        }
    }
    list.shuffle(&mut thread_rng());
    list
}

/// Per-process load balancer state, keyed by logical service name.
pub struct LoadBalancer {
    services: DashMap<String, Arc<ServiceState>>,
    config_path: PathBuf,
    last_mtime: RwLock<Option<SystemTime>>,
}

impl LoadBalancer {
    /// Load the config file; failure here is fatal at startup per spec §6
    /// ("File absence at startup is fatal").
    pub fn load(config_path: impl Into<PathBuf>) -> RpcResult<Self> {
        let config_path = config_path.into();
        let config = BalancerConfig::load(&config_path)
            .map_err(|err| RpcError::InvalidConfig(err.to_string()))?;

        let services = DashMap::new();
        for (service, endpoints) in &config.0 {
            services.insert(service.clone(), Arc::new(ServiceState::new(expand_weights(endpoints))));
        }

        let mtime = std::fs::metadata(&config_path).ok().and_then(|m| m.modified().ok());

        Ok(Self {
            services,
            config_path,
            last_mtime: RwLock::new(mtime),
        })
    }

    /// Select an endpoint for `service`, skipping the broken set. Retries
    /// up to the list length before falling back to the first element as
    /// a last resort, per spec §4.6.
    pub fn get_server(&self, service: &str) -> Option<String> {
        let state = self.services.get(service)?;
        let weighted = state.weighted.read();
        if weighted.is_empty() {
            return None;
        }

        for _ in 0..weighted.len() {
            let idx = state.cursor.fetch_add(1, Ordering::Relaxed) % weighted.len();
            let candidate = &weighted[idx];
            if !state.broken.contains(candidate) {
                return Some(candidate.clone());
            }
        }

        warn!(service, "every endpoint is broken, falling back to first entry");
        Some(weighted[0].clone())
    }

    /// Record that `endpoint` failed a call; it is excluded from
    /// selection until the liveness probe observes it alive again.
    pub fn set_broken_server(&self, service: &str, endpoint: &str) {
        if let Some(state) = self.services.get(service) {
            state.broken.insert(endpoint.to_string());
            warn!(service, endpoint, "marked endpoint broken");
        }
    }

    pub fn is_broken(&self, service: &str, endpoint: &str) -> bool {
        self.services
            .get(service)
            .map(|state| state.broken.contains(endpoint))
            .unwrap_or(false)
    }

    /// One liveness-probe-and-reload tick: probe every broken endpoint
    /// with a short TCP connect and clear it if it answers, then re-read
    /// the config file if its mtime changed.
    async fn tick(&self) {
        for entry in self.services.iter() {
            let (service, state) = (entry.key().clone(), Arc::clone(entry.value()));
            let broken: Vec<String> = state.broken.iter().map(|e| e.clone()).collect();
            for endpoint in broken {
                if probe_alive(&endpoint).await {
                    state.broken.remove(&endpoint);
                    info!(service, endpoint, "liveness probe succeeded, un-quarantining");
                }
            }
        }

        if let Err(err) = self.reload_if_changed() {
            warn!(error = %err, "load balancer config reload failed");
        }
    }

    fn reload_if_changed(&self) -> RpcResult<()> {
        let mtime = std::fs::metadata(&self.config_path)
            .map_err(|err| RpcError::InvalidConfig(err.to_string()))?
            .modified()
            .map_err(|err| RpcError::InvalidConfig(err.to_string()))?;

        if *self.last_mtime.read() == Some(mtime) {
            return Ok(());
        }

        let config = BalancerConfig::load(&self.config_path)
            .map_err(|err| RpcError::InvalidConfig(err.to_string()))?;

        for (service, endpoints) in &config.0 {
            let fresh = expand_weights(endpoints);
            match self.services.get(service) {
                Some(state) => {
                    *state.weighted.write() = fresh;
                }
                None => {
                    self.services.insert(service.clone(), Arc::new(ServiceState::new(fresh)));
                }
            }
        }

        *self.last_mtime.write() = Some(mtime);
        info!(path = %self.config_path.display(), "load balancer config reloaded");
        Ok(())
    }

    /// Spawn the background quarantine-recovery / reload scheduler. The
    /// returned handle can be aborted as part of graceful shutdown.
    pub fn spawn_background_loop(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                balancer.tick().await;
            }
        })
    }
}

/// A short TCP connect used as a liveness check; doesn't send or expect
/// any payload, per spec §4.6 ("probe each broken endpoint with a TCP
/// connect (≤500 ms)").
async fn probe_alive(endpoint: &str) -> bool {
    matches!(
        timeout(Duration::from_millis(500), TcpStream::connect(endpoint)).await,
        Ok(Ok(_))
    )
}
