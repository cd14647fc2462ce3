//! Security manager and credential rotation.
//!
//! # Features
//!
//! - Named security profiles, built lazily and cached
//! - Credential rotation: PEM files are polled for modification and rebuilt
//! - A generation counter that lets endpoints detect stale channels
//! - Reload statistics

use super::tls::{SecurityContext, SecurityProfile};
use crate::core::error::{ClientError, ClientResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Name of the profile used when an endpoint does not name one.
pub const DEFAULT_PROFILE: &str = "default";

/// Security manager configuration.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Enable the background credential refresher.
    pub auto_reload: bool,
    /// Credential check interval.
    pub check_interval: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auto_reload: true,
            check_interval: Duration::from_secs(60),
        }
    }
}

type Fingerprint = Vec<(PathBuf, Option<SystemTime>)>;

#[derive(Debug)]
struct ProfileEntry {
    profile: SecurityProfile,
    context: Option<SecurityContext>,
    fingerprint: Fingerprint,
    /// Changes whenever the profile or its context is replaced.
    epoch: u64,
}

impl ProfileEntry {
    fn unbuilt(profile: SecurityProfile, epoch: u64) -> Self {
        Self {
            profile,
            context: None,
            fingerprint: Vec::new(),
            epoch,
        }
    }
}

/// A context rebuilt off-lock, tagged with the epoch it was built from.
struct Rebuilt {
    name: String,
    epoch: u64,
    context: SecurityContext,
    fingerprint: Fingerprint,
}

/// Security manager owning every profile the client uses.
#[derive(Debug)]
pub struct SecurityManager {
    /// Configuration.
    config: SecurityConfig,
    /// Profiles by name.
    profiles: RwLock<HashMap<String, ProfileEntry>>,
    /// Bumped whenever any built context changes.
    generation: AtomicU64,
    /// Source of profile entry epochs.
    epochs: AtomicU64,
    /// Statistics.
    stats: SecurityStats,
}

/// Security statistics.
#[derive(Debug, Default)]
struct SecurityStats {
    /// Number of credential reloads.
    reloads: AtomicU64,
    /// Number of failed reload attempts.
    reload_failures: AtomicU64,
}

impl SecurityManager {
    /// Create a manager with the given profiles.
    ///
    /// A plaintext `default` profile is added when none is supplied.
    pub fn new(config: SecurityConfig, profiles: HashMap<String, SecurityProfile>) -> Self {
        let mut entries: HashMap<String, ProfileEntry> = profiles
            .into_iter()
            .map(|(name, profile)| (name, ProfileEntry::unbuilt(profile, 0)))
            .collect();
        entries
            .entry(DEFAULT_PROFILE.to_string())
            .or_insert_with(|| ProfileEntry::unbuilt(SecurityProfile::plaintext(), 0));
        Self {
            config,
            profiles: RwLock::new(entries),
            generation: AtomicU64::new(0),
            epochs: AtomicU64::new(0),
            stats: SecurityStats::default(),
        }
    }

    /// Manager with only the plaintext default profile.
    pub fn plaintext() -> Self {
        Self::new(SecurityConfig::default(), HashMap::new())
    }

    /// Current security generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Names of all known profiles.
    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Check whether a profile exists.
    pub fn has_profile(&self, name: &str) -> bool {
        self.profiles.read().contains_key(name)
    }

    /// Add or replace a profile. Replacing bumps the generation.
    pub fn set_profile(&self, name: impl Into<String>, profile: SecurityProfile) {
        let name = name.into();
        let entry = ProfileEntry::unbuilt(profile, self.next_epoch());
        let replaced = self.profiles.write().insert(name.clone(), entry).is_some();
        if replaced {
            self.bump(&name);
        }
    }

    /// Built context for a profile, building it on first use.
    pub fn context(&self, name: &str) -> ClientResult<SecurityContext> {
        if let Some(ctx) = self
            .profiles
            .read()
            .get(name)
            .and_then(|e| e.context.clone())
        {
            return Ok(ctx);
        }

        let mut profiles = self.profiles.write();
        let entry = profiles
            .get_mut(name)
            .ok_or_else(|| ClientError::config(format!("unknown security profile: {}", name)))?;
        if let Some(ctx) = &entry.context {
            return Ok(ctx.clone());
        }
        let fingerprint = fingerprint(&entry.profile);
        let ctx = entry.profile.build(name)?;
        tracing::debug!(profile = %name, tls = ctx.is_tls(), "security context built");
        entry.context = Some(ctx.clone());
        entry.fingerprint = fingerprint;
        entry.epoch = self.next_epoch();
        Ok(ctx)
    }

    /// Rebuild every profile whose files changed on disk.
    ///
    /// Returns the number of profiles rebuilt. A profile that fails to rebuild keeps
    /// its previous context. File reads and context builds run without holding the
    /// profile lock; call from a blocking context.
    pub fn refresh(&self) -> usize {
        let rebuilt: Vec<Rebuilt> = self
            .built_profiles()
            .into_iter()
            .filter_map(|(name, epoch, profile, previous)| {
                let current = fingerprint(&profile);
                if current == previous {
                    return None;
                }
                match profile.build(&name) {
                    Ok(context) => Some(Rebuilt {
                        name,
                        epoch,
                        context,
                        fingerprint: current,
                    }),
                    Err(e) => {
                        self.stats.reload_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(profile = %name, error = %e, "credential reload failed");
                        None
                    }
                }
            })
            .collect();
        self.install(rebuilt)
    }

    /// Snapshot of every profile with a built context.
    fn built_profiles(&self) -> Vec<(String, u64, SecurityProfile, Fingerprint)> {
        self.profiles
            .read()
            .iter()
            .filter(|(_, entry)| entry.context.is_some())
            .map(|(name, entry)| {
                (
                    name.clone(),
                    entry.epoch,
                    entry.profile.clone(),
                    entry.fingerprint.clone(),
                )
            })
            .collect()
    }

    /// Swap rebuilt contexts in. Entries replaced or rebuilt since the snapshot
    /// are left alone.
    fn install(&self, rebuilt: Vec<Rebuilt>) -> usize {
        let mut installed = Vec::new();
        {
            let mut profiles = self.profiles.write();
            for update in rebuilt {
                let Some(entry) = profiles.get_mut(&update.name) else {
                    continue;
                };
                if entry.epoch != update.epoch {
                    tracing::debug!(profile = %update.name, "profile changed during reload");
                    continue;
                }
                entry.context = Some(update.context);
                entry.fingerprint = update.fingerprint;
                entry.epoch = self.next_epoch();
                installed.push(update.name);
            }
        }
        for name in &installed {
            self.bump(name);
        }
        installed.len()
    }

    /// Spawn the background refresher. Stops when `cancel` fires.
    ///
    /// Each check runs on the blocking pool. Returns `None` when auto reload is
    /// disabled.
    pub fn spawn_refresher(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.auto_reload {
            return None;
        }
        let manager = Arc::clone(self);
        let interval = self.config.check_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let manager = Arc::clone(&manager);
                        if let Err(e) = tokio::task::spawn_blocking(move || manager.refresh()).await {
                            tracing::warn!(error = %e, "credential refresh task failed");
                        }
                    }
                }
            }
        }))
    }

    /// Get security metrics.
    pub fn metrics(&self) -> SecurityMetrics {
        SecurityMetrics {
            credential_reloads: self.stats.reloads.load(Ordering::Relaxed),
            reload_failures: self.stats.reload_failures.load(Ordering::Relaxed),
            generation: self.generation(),
        }
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn bump(&self, name: &str) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.reloads.fetch_add(1, Ordering::Relaxed);
        tracing::info!(profile = %name, generation, "security context rotated");
    }
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::plaintext()
    }
}

/// Security metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityMetrics {
    /// Number of credential reloads.
    pub credential_reloads: u64,
    /// Number of failed reload attempts.
    pub reload_failures: u64,
    /// Current generation.
    pub generation: u64,
}

fn fingerprint(profile: &SecurityProfile) -> Fingerprint {
    profile
        .watched_files()
        .into_iter()
        .map(|p| {
            let mtime = std::fs::metadata(p).and_then(|m| m.modified()).ok();
            (p.to_path_buf(), mtime)
        })
        .collect()
}
