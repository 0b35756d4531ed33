use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{DatabaseError, DatabaseResult, PunishmentBackend, sort_by_creation};
use super::models::punishment::Punishment;

/// Process-local backend. Nothing survives a restart; meant for tests and
/// for embedding the manager where persistence is handled elsewhere.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<Vec<Punishment>>,
    failing: AtomicBool
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails as if storage were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_available(&self) -> DatabaseResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query(String::from("memory backend is unavailable")));
        }
        Ok(())
    }

    fn select<F: Fn(&Punishment) -> bool>(&self, filter: F) -> Vec<Punishment> {
        let mut selected: Vec<Punishment> = self.records.read().iter().filter(|p| filter(p)).cloned().collect();
        sort_by_creation(&mut selected);
        selected
    }
}

#[async_trait]
impl PunishmentBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, punishment: &Punishment) -> DatabaseResult<()> {
        self.check_available()?;
        let mut records = self.records.write();
        if records.iter().any(|p| p.id == punishment.id) {
            return Err(DatabaseError::Query(format!("duplicate punishment id {}", punishment.id)));
        }
        records.push(punishment.clone());
        Ok(())
    }

    async fn update(&self, punishment: &Punishment) -> DatabaseResult<()> {
        self.check_available()?;
        let mut records = self.records.write();
        if let Some(stored) = records.iter_mut().find(|p| p.id == punishment.id) {
            if !punishment.is_active() {
                stored.deactivate();
            }
            stored.banned_ip = punishment.banned_ip.clone();
        }
        Ok(())
    }

    async fn load_all_active(&self) -> DatabaseResult<Vec<Punishment>> {
        self.check_available()?;
        Ok(self.select(|p| p.is_active()))
    }

    async fn load_for_target(&self, target_id: &str) -> DatabaseResult<Vec<Punishment>> {
        self.check_available()?;
        Ok(self.select(|p| p.target_id == target_id))
    }

    async fn load_for_targets(&self, target_ids: &[String]) -> DatabaseResult<Vec<Punishment>> {
        self.check_available()?;
        Ok(self.select(|p| target_ids.contains(&p.target_id)))
    }

    async fn load_for_ip(&self, ip: &str) -> DatabaseResult<Vec<Punishment>> {
        self.check_available()?;
        Ok(self.select(|p| p.is_active() && p.banned_ip.as_deref() == Some(ip)))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::database::models::punishment::PunishmentType;

    #[tokio::test]
    async fn update_persists_mutable_fields_only() {
        let backend = MemoryBackend::new();
        let pun = Punishment::new("alice", PunishmentType::Ban, "cheating", None, None, None, Utc::now());
        backend.save(&pun).await.unwrap();

        let mut changed = pun.clone();
        changed.reason = String::from("rewritten");
        changed.deactivate();
        backend.update(&changed).await.unwrap();

        let stored = backend.load_for_target("alice").await.unwrap().remove(0);
        assert_eq!(stored.reason, "cheating");
        assert!(!stored.is_active());
        assert!(backend.load_all_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_switch_surfaces_errors() {
        let backend = MemoryBackend::new();
        backend.set_failing(true);
        assert!(backend.load_all_active().await.is_err());
        backend.set_failing(false);
        assert!(backend.load_all_active().await.unwrap().is_empty());
    }
}
