use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::SweepScope;
use crate::database::{DatabaseResult, PunishmentBackend, sort_by_creation};
use crate::database::cache::{PunishmentCache, PunishmentIndex};
use crate::database::models::punishment::{Punishment, PunishmentType};
use crate::util::{string::hash_ip, time::{self, Clock, SystemClock}, webhook::WebhookUtils};

use self::hooks::{Enforcement, Enforcer, NoopEnforcer, PunishmentListener, Verdict};

pub mod hooks;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PunishmentError {
    #[error("an IP ban needs the address to ban")]
    MissingIp
}

#[derive(Debug, Clone, PartialEq)]
pub enum PunishOutcome {
    Issued(Punishment),
    Vetoed
}

impl PunishOutcome {
    pub fn issued(self) -> Option<Punishment> {
        match self {
            PunishOutcome::Issued(punishment) => Some(punishment),
            PunishOutcome::Vetoed => None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginDecision {
    Allowed,
    Denied(Punishment)
}

/// Single entry point for issuing, querying and lifting punishments.
///
/// Storage is authoritative for single-record lookups (`get_active_punishment`,
/// `get_ip_ban`), which always hit the backend even though the same data may
/// be cached. Listings are served from the cache and may lag behind storage
/// until the next rebuild or reload.
pub struct PunishmentManager {
    backend: Arc<dyn PunishmentBackend>,
    cache: PunishmentCache,
    clock: Arc<dyn Clock>,
    listeners: Vec<Arc<dyn PunishmentListener>>,
    enforcer: Arc<dyn Enforcer>,
    webhooks: Option<Arc<WebhookUtils>>,
    sweep_scope: SweepScope,
    ip_hashing: bool
}

pub struct PunishmentManagerBuilder {
    backend: Arc<dyn PunishmentBackend>,
    clock: Arc<dyn Clock>,
    listeners: Vec<Arc<dyn PunishmentListener>>,
    enforcer: Arc<dyn Enforcer>,
    webhooks: Option<Arc<WebhookUtils>>,
    sweep_scope: SweepScope,
    ip_hashing: bool
}

impl PunishmentManagerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn PunishmentListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn enforcer(mut self, enforcer: Arc<dyn Enforcer>) -> Self {
        self.enforcer = enforcer;
        self
    }

    pub fn webhooks(mut self, webhooks: WebhookUtils) -> Self {
        self.webhooks = if webhooks.is_enabled() { Some(Arc::new(webhooks)) } else { None };
        self
    }

    pub fn sweep_scope(mut self, sweep_scope: SweepScope) -> Self {
        self.sweep_scope = sweep_scope;
        self
    }

    pub fn ip_hashing(mut self, ip_hashing: bool) -> Self {
        self.ip_hashing = ip_hashing;
        self
    }

    /// Fills the cache from storage. Failing to do so leaves the manager
    /// unusable, so the error is returned rather than logged.
    pub async fn build(self) -> DatabaseResult<PunishmentManager> {
        let manager = PunishmentManager {
            backend: self.backend,
            cache: PunishmentCache::new(),
            clock: self.clock,
            listeners: self.listeners,
            enforcer: self.enforcer,
            webhooks: self.webhooks,
            sweep_scope: self.sweep_scope,
            ip_hashing: self.ip_hashing
        };
        manager.rebuild_cache().await?;
        info!("Loaded {} active punishments from {}", manager.cache.snapshot().len(), manager.backend.name());
        Ok(manager)
    }
}

impl PunishmentManager {
    pub fn builder(backend: Arc<dyn PunishmentBackend>) -> PunishmentManagerBuilder {
        PunishmentManagerBuilder {
            backend,
            clock: Arc::new(SystemClock),
            listeners: Vec::new(),
            enforcer: Arc::new(NoopEnforcer),
            webhooks: None,
            sweep_scope: SweepScope::Store,
            ip_hashing: false
        }
    }

    /// Issues a punishment. Listeners may veto it, in which case nothing is
    /// stored, cached or enforced. A failed save is logged and the punishment
    /// is still cached and enforced for the lifetime of this process.
    pub async fn punish(
        &self,
        target_id: &str,
        kind: PunishmentType,
        reason: &str,
        issuer_id: Option<&str>,
        duration: Option<i64>,
        ip: Option<&str>
    ) -> Result<PunishOutcome, PunishmentError> {
        let banned_ip = match kind {
            PunishmentType::IpBan => match ip.map(str::trim) {
                Some(ip) if !ip.is_empty() => Some(self.normalize_ip(ip)),
                _ => return Err(PunishmentError::MissingIp)
            },
            _ => None
        };
        let punishment = Punishment::new(target_id, kind, reason, issuer_id, duration, banned_ip, self.clock.now());

        if self.listeners.iter().any(|listener| listener.before_commit(&punishment) == Verdict::Veto) {
            info!("{} for {} was vetoed", kind, target_id);
            return Ok(PunishOutcome::Vetoed);
        }

        if let Err(e) = self.backend.save(&punishment).await {
            error!("Failed to save punishment {} for {}: {}", punishment.id, target_id, e);
        }
        self.cache.modify(|index| index.insert(punishment.clone()));

        info!(
            "{} was {} by {} for: {}",
            target_id,
            kind,
            issuer_id.unwrap_or("Console"),
            reason
        );
        self.enforcer.enforce(Enforcement::for_punishment(&punishment));

        if let Some(webhooks) = &self.webhooks {
            // take ownership for the spawned task
            let webhooks = Arc::clone(webhooks);
            let issued = punishment.clone();
            tokio::spawn(async move {
                webhooks.send_punishment_webhook(&issued).await;
            });
        }
        Ok(PunishOutcome::Issued(punishment))
    }

    /// The earliest enforced punishment of `kind` for the target, read from
    /// storage. A `Ban` request also matches temporary bans.
    pub async fn get_active_punishment(&self, target_id: &str, kind: PunishmentType) -> DatabaseResult<Option<Punishment>> {
        let now = self.clock.now();
        let mut records = self.backend.load_for_target(target_id).await.map_err(|e| {
            error!("Failed to load punishments for {}: {}", target_id, e);
            e
        })?;
        sort_by_creation(&mut records);
        Ok(records.into_iter().find(|p| p.kind.satisfies(kind) && p.is_enforced_at(now)))
    }

    /// Lifts the punishment `get_active_punishment` resolves to, then rebuilds
    /// the cache. Returns the lifted record, or `None` if nothing was active.
    pub async fn remove_punishment(&self, target_id: &str, kind: PunishmentType) -> DatabaseResult<Option<Punishment>> {
        let mut punishment = match self.get_active_punishment(target_id, kind).await? {
            Some(punishment) => punishment,
            None => return Ok(None)
        };
        self.deactivate(&mut punishment).await;
        self.cache.modify(|index| index.insert(punishment.clone()));
        if let Err(e) = self.rebuild_cache().await {
            error!("Cache rebuild after lifting {} failed, keeping previous snapshot: {}", punishment.id, e);
        }
        self.notify_lifted(&punishment);
        Ok(Some(punishment))
    }

    /// Builds a fresh snapshot off to the side and publishes it in one step.
    /// It holds every active record plus the full history of targets that
    /// were already cached.
    pub async fn rebuild_cache(&self) -> DatabaseResult<()> {
        let mut records = self.backend.load_all_active().await?;
        let known_targets = self.cache.snapshot().targets();
        records.extend(self.backend.load_for_targets(&known_targets).await?);
        self.cache.publish(PunishmentIndex::from_records(records));
        Ok(())
    }

    /// Refreshes one target's history from storage, typically just before
    /// the target joins.
    pub async fn reload_player_punishments(&self, target_id: &str) -> DatabaseResult<Vec<Punishment>> {
        let records = self.backend.load_for_target(target_id).await?;
        self.cache.modify(|index| index.replace_target(target_id, records.clone()));
        Ok(records)
    }

    pub fn get_player_punishments(&self, target_id: &str) -> Vec<Punishment> {
        self.cache.snapshot().for_target(target_id)
    }

    pub fn get_all_punishments(&self) -> Vec<Punishment> {
        self.cache.snapshot().all()
    }

    /// The earliest enforced ban on `ip`, or the earliest active one when all
    /// of them have lapsed. Storage is asked first; the cache only answers
    /// when storage has nothing.
    pub async fn get_ip_ban(&self, ip: &str) -> DatabaseResult<Option<Punishment>> {
        self.lookup_ip_ban(&self.normalize_ip(ip)).await
    }

    pub async fn is_ip_banned(&self, ip: &str) -> bool {
        self.enforced_ip_ban(&self.normalize_ip(ip)).await.is_some()
    }

    pub async fn remove_ip_ban(&self, ip: &str) -> DatabaseResult<Option<Punishment>> {
        let ip = self.normalize_ip(ip);
        let mut ban = match self.lookup_ip_ban(&ip).await? {
            Some(ban) if ban.is_active() => ban,
            _ => return Ok(None)
        };
        self.deactivate(&mut ban).await;
        self.cache.modify(|index| {
            index.remove_ip_ban(&ip);
            index.mark_inactive(&ban);
        });
        self.notify_lifted(&ban);
        Ok(Some(ban))
    }

    /// Deactivates every swept punishment whose window has elapsed and returns
    /// how many were deactivated. With [`SweepScope::Store`] the swept set is
    /// every active record in storage, so copies lifted by another writer are
    /// left alone; the cache is only swept when that read fails. With
    /// [`SweepScope::Cache`] only cached punishments are swept.
    pub async fn cleanup_expired_punishments(&self) -> usize {
        let now = self.clock.now();
        let candidates = match self.sweep_scope {
            SweepScope::Cache => self.cache.snapshot().all(),
            SweepScope::Store => match self.backend.load_all_active().await {
                Ok(records) => records,
                Err(e) => {
                    error!("Sweep could not load active punishments, sweeping the cache only: {}", e);
                    self.cache.snapshot().all()
                }
            }
        };

        let mut expired: Vec<Punishment> = candidates.into_iter()
            .filter(|p| p.is_active() && p.is_expired_at(now))
            .collect();
        sort_by_creation(&mut expired);

        let mut deactivated = 0;
        for mut punishment in expired {
            if self.deactivate(&mut punishment).await {
                self.cache.modify(|index| index.mark_inactive(&punishment));
                deactivated += 1;
            }
        }
        if deactivated > 0 {
            info!("Deactivated {} expired punishments", deactivated);
        } else {
            debug!("No expired punishments to deactivate");
        }
        deactivated
    }

    pub fn format_expiration(&self, expiration: DateTime<Utc>) -> String {
        time::format_expiration(expiration, self.clock.now())
    }

    /// Address bans are checked before account bans.
    pub async fn check_login(&self, target_id: &str, ip: Option<&str>) -> LoginDecision {
        if let Some(ip) = ip {
            if let Some(ban) = self.enforced_ip_ban(&self.normalize_ip(ip)).await {
                return LoginDecision::Denied(ban);
            }
        }
        match self.enforced_or_cached(target_id, PunishmentType::Ban).await {
            Some(ban) => LoginDecision::Denied(ban),
            None => LoginDecision::Allowed
        }
    }

    pub async fn check_chat(&self, target_id: &str) -> Option<Punishment> {
        self.enforced_or_cached(target_id, PunishmentType::Mute).await
    }

    /// Releases the storage handle.
    pub async fn shutdown(&self) {
        self.backend.close().await;
        info!("Closed {} punishment storage", self.backend.name());
    }

    fn normalize_ip(&self, ip: &str) -> String {
        hash_ip(self.ip_hashing, ip)
    }

    async fn lookup_ip_ban(&self, ip: &str) -> DatabaseResult<Option<Punishment>> {
        let mut bans = self.backend.load_for_ip(ip).await?;
        if bans.is_empty() {
            return Ok(self.cache.snapshot().ip_ban(ip));
        }
        sort_by_creation(&mut bans);
        // a lapsed ban that has not been swept yet must not shadow a newer one
        let now = self.clock.now();
        let chosen = bans.iter().position(|ban| ban.is_enforced_at(now)).unwrap_or(0);
        Ok(Some(bans.swap_remove(chosen)))
    }

    async fn enforced_ip_ban(&self, ip: &str) -> Option<Punishment> {
        let ban = match self.lookup_ip_ban(ip).await {
            Ok(ban) => ban,
            Err(e) => {
                error!("IP ban lookup failed, using cached bans: {}", e);
                self.cache.snapshot().ip_ban(ip)
            }
        };
        let now = self.clock.now();
        ban.filter(|ban| ban.is_enforced_at(now))
    }

    async fn enforced_or_cached(&self, target_id: &str, kind: PunishmentType) -> Option<Punishment> {
        match self.get_active_punishment(target_id, kind).await {
            Ok(punishment) => punishment,
            Err(_) => {
                let now = self.clock.now();
                self.cache.snapshot().for_target(target_id)
                    .into_iter()
                    .find(|p| p.kind.satisfies(kind) && p.is_enforced_at(now))
            }
        }
    }

    /// Returns false when the record was already inactive; nothing is
    /// persisted or announced in that case.
    async fn deactivate(&self, punishment: &mut Punishment) -> bool {
        if !punishment.deactivate() {
            return false;
        }
        if let Err(e) = self.backend.update(punishment).await {
            error!("Failed to persist deactivation of punishment {}: {}", punishment.id, e);
        }
        for listener in &self.listeners {
            listener.after_deactivate(punishment);
        }
        true
    }

    fn notify_lifted(&self, punishment: &Punishment) {
        if let Some(webhooks) = &self.webhooks {
            let webhooks = Arc::clone(webhooks);
            let lifted = punishment.clone();
            tokio::spawn(async move {
                webhooks.send_punishment_lifted_webhook(&lifted).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use parking_lot::Mutex;

    use super::*;
    use crate::database::memory::MemoryBackend;
    use crate::punishment::hooks::ChannelEnforcer;
    use crate::util::time::ManualClock;

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    async fn manager_with(backend: Arc<MemoryBackend>, clock: Arc<ManualClock>) -> PunishmentManager {
        PunishmentManager::builder(backend).clock(clock).build().await.unwrap()
    }

    struct VetoMutes;

    impl PunishmentListener for VetoMutes {
        fn before_commit(&self, punishment: &Punishment) -> Verdict {
            if punishment.kind == PunishmentType::Mute { Verdict::Veto } else { Verdict::Proceed }
        }
    }

    #[derive(Default)]
    struct Recorder {
        lifted: Mutex<Vec<String>>,
        offered: AtomicUsize
    }

    impl PunishmentListener for Recorder {
        fn before_commit(&self, _punishment: &Punishment) -> Verdict {
            self.offered.fetch_add(1, Ordering::SeqCst);
            Verdict::Proceed
        }

        fn after_deactivate(&self, punishment: &Punishment) {
            self.lifted.lock().push(punishment.id.clone());
        }
    }

    #[tokio::test]
    async fn vetoed_punishments_leave_no_trace() {
        let backend = Arc::new(MemoryBackend::new());
        let (enforcer, mut receiver) = ChannelEnforcer::channel();
        let manager = PunishmentManager::builder(backend.clone())
            .listener(Arc::new(VetoMutes))
            .enforcer(Arc::new(enforcer))
            .build().await.unwrap();

        let outcome = manager.punish("alice", PunishmentType::Mute, "caps", None, Some(60), None).await.unwrap();
        assert_eq!(outcome, PunishOutcome::Vetoed);
        assert!(backend.is_empty());
        assert!(manager.get_all_punishments().is_empty());
        assert!(receiver.try_recv().is_err());

        manager.punish("alice", PunishmentType::Kick, "afk", None, None, None).await.unwrap();
        assert_eq!(backend.len(), 1);
        assert!(matches!(receiver.try_recv().unwrap(), Enforcement::Disconnect(_)));
    }

    #[tokio::test]
    async fn listener_sees_each_commit_and_lift_once() {
        let backend = Arc::new(MemoryBackend::new());
        let recorder = Arc::new(Recorder::default());
        let manager = PunishmentManager::builder(backend)
            .listener(recorder.clone())
            .build().await.unwrap();

        let ban = manager.punish("bob", PunishmentType::Ban, "grief", Some("mod"), None, None)
            .await.unwrap().issued().unwrap();
        assert_eq!(recorder.offered.load(Ordering::SeqCst), 1);

        manager.remove_punishment("bob", PunishmentType::Ban).await.unwrap();
        assert!(manager.remove_punishment("bob", PunishmentType::Ban).await.unwrap().is_none());
        assert_eq!(*recorder.lifted.lock(), vec![ban.id]);
    }

    #[tokio::test]
    async fn ip_ban_requires_an_address() {
        let manager = manager_with(Arc::new(MemoryBackend::new()), Arc::new(ManualClock::new(start()))).await;
        let err = manager.punish("carol", PunishmentType::IpBan, "alts", None, None, Some("  ")).await;
        assert_eq!(err, Err(PunishmentError::MissingIp));

        let kick = manager.punish("carol", PunishmentType::Kick, "afk", None, None, Some("10.0.0.9"))
            .await.unwrap().issued().unwrap();
        assert!(kick.banned_ip.is_none());
    }

    #[tokio::test]
    async fn hashed_addresses_are_never_stored_raw() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = PunishmentManager::builder(backend.clone()).ip_hashing(true).build().await.unwrap();
        let ban = manager.punish("dave", PunishmentType::IpBan, "alts", None, None, Some("10.0.0.5"))
            .await.unwrap().issued().unwrap();

        assert_eq!(ban.banned_ip.as_deref(), Some(hash_ip(true, "10.0.0.5").as_str()));
        assert!(manager.is_ip_banned("10.0.0.5").await);
        assert!(backend.load_for_ip("10.0.0.5").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookups_report_storage_errors() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_with(backend.clone(), Arc::new(ManualClock::new(start()))).await;
        manager.punish("erin", PunishmentType::Mute, "spam", None, None, None).await.unwrap();

        backend.set_failing(true);
        assert!(manager.get_active_punishment("erin", PunishmentType::Mute).await.is_err());
        // admission checks fall back to the cache
        assert!(manager.check_chat("erin").await.is_some());
        assert_eq!(manager.check_login("erin", None).await, LoginDecision::Allowed);
    }

    #[tokio::test]
    async fn save_failure_still_enforces() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_with(backend.clone(), Arc::new(ManualClock::new(start()))).await;
        backend.set_failing(true);

        let ban = manager.punish("frank", PunishmentType::Ban, "x", None, None, None).await.unwrap().issued().unwrap();
        assert_eq!(manager.get_player_punishments("frank"), vec![ban]);
        backend.set_failing(false);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn cache_scope_ignores_uncached_records() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(start()));
        let stale = Punishment::new("gina", PunishmentType::TempBan, "x", None, Some(10), None, start());
        backend.save(&stale).await.unwrap();

        let manager = PunishmentManager::builder(backend.clone())
            .clock(clock.clone())
            .sweep_scope(SweepScope::Cache)
            .build().await.unwrap();
        // drop everything cached so the record only lives in storage
        manager.cache.publish(PunishmentIndex::default());
        clock.advance(60);

        assert_eq!(manager.cleanup_expired_punishments().await, 0);
        assert_eq!(backend.load_all_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_scope_sweeps_uncached_records() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(start()));
        let stale = Punishment::new("gina", PunishmentType::TempBan, "x", None, Some(10), None, start());
        backend.save(&stale).await.unwrap();

        let manager = manager_with(backend.clone(), clock.clone()).await;
        manager.cache.publish(PunishmentIndex::default());
        clock.advance(60);

        assert_eq!(manager.cleanup_expired_punishments().await, 1);
        assert!(backend.load_all_active().await.unwrap().is_empty());
        assert_eq!(manager.cleanup_expired_punishments().await, 0);
    }

    #[tokio::test]
    async fn formats_relative_to_the_clock() {
        let manager = manager_with(Arc::new(MemoryBackend::new()), Arc::new(ManualClock::new(start()))).await;
        let expiration = start() + chrono::Duration::hours(49);
        assert_eq!(manager.format_expiration(expiration), "2 days 1 hours");
    }

    #[tokio::test]
    async fn unsaved_ip_ban_is_answered_from_the_cache() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_with(backend.clone(), Arc::new(ManualClock::new(start()))).await;
        backend.set_failing(true);
        let ban = manager.punish("hank", PunishmentType::IpBan, "alts", None, None, Some("10.0.0.11"))
            .await.unwrap().issued().unwrap();
        backend.set_failing(false);

        assert!(backend.load_for_ip("10.0.0.11").await.unwrap().is_empty());
        assert_eq!(manager.get_ip_ban("10.0.0.11").await.unwrap(), Some(ban));
        assert!(manager.is_ip_banned("10.0.0.11").await);
        assert!(!manager.is_ip_banned("10.0.0.12").await);
    }

    #[tokio::test]
    async fn login_uses_cached_ip_bans_while_storage_is_down() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager_with(backend.clone(), Arc::new(ManualClock::new(start()))).await;
        let ban = manager.punish("ivan", PunishmentType::IpBan, "alts", None, None, Some("10.0.0.13"))
            .await.unwrap().issued().unwrap();

        backend.set_failing(true);
        assert!(manager.get_ip_ban("10.0.0.13").await.is_err());
        assert_eq!(manager.check_login("newcomer", Some("10.0.0.13")).await, LoginDecision::Denied(ban));
        assert_eq!(manager.check_login("newcomer", Some("10.0.0.14")).await, LoginDecision::Allowed);
    }

    #[tokio::test]
    async fn sweep_skips_records_lifted_elsewhere() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(start()));
        let recorder = Arc::new(Recorder::default());
        let manager = PunishmentManager::builder(backend.clone())
            .clock(clock.clone())
            .listener(recorder.clone())
            .build().await.unwrap();
        let ban = manager.punish("jane", PunishmentType::TempBan, "x", None, Some(10), None)
            .await.unwrap().issued().unwrap();

        // another process lifts it; this cache still holds the active copy
        let mut lifted = ban.clone();
        lifted.deactivate();
        backend.update(&lifted).await.unwrap();
        assert!(manager.get_player_punishments("jane")[0].is_active());

        clock.advance(60);
        assert_eq!(manager.cleanup_expired_punishments().await, 0);
        assert!(recorder.lifted.lock().is_empty());
    }
}
