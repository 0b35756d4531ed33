use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use super::models::punishment::{Punishment, PunishmentType};
use super::sort_by_creation;

/// One immutable view of the cached punishments.
///
/// Target lists hold every non-IP punishment of a target ordered by creation.
/// Active IP bans are indexed by address only.
#[derive(Debug, Default, Clone)]
pub struct PunishmentIndex {
    by_target: HashMap<String, Vec<Punishment>>,
    by_ip: HashMap<String, Punishment>
}

impl PunishmentIndex {
    pub fn from_records<I: IntoIterator<Item = Punishment>>(records: I) -> Self {
        let mut index = PunishmentIndex::default();
        for punishment in records {
            index.insert(punishment);
        }
        index
    }

    pub fn insert(&mut self, punishment: Punishment) {
        if punishment.kind == PunishmentType::IpBan {
            if let Some(ip) = punishment.banned_ip.clone() {
                if punishment.is_active() {
                    self.by_ip.insert(ip, punishment);
                } else {
                    self.by_ip.retain(|_, ban| ban.id != punishment.id);
                }
                return;
            }
        }
        let records = self.by_target.entry(punishment.target_id.clone()).or_default();
        match records.iter_mut().find(|cached| cached.id == punishment.id) {
            Some(cached) => *cached = punishment,
            None => {
                records.push(punishment);
                sort_by_creation(records);
            }
        }
    }

    /// Swaps in the full history of one target.
    pub fn replace_target(&mut self, target_id: &str, records: Vec<Punishment>) {
        self.by_target.remove(target_id);
        self.by_ip.retain(|_, ban| ban.target_id != target_id);
        for punishment in records {
            self.insert(punishment);
        }
    }

    pub fn for_target(&self, target_id: &str) -> Vec<Punishment> {
        let mut records = self.by_target.get(target_id).cloned().unwrap_or_default();
        records.extend(self.by_ip.values().filter(|ban| ban.target_id == target_id).cloned());
        sort_by_creation(&mut records);
        records
    }

    pub fn ip_ban(&self, ip: &str) -> Option<Punishment> {
        self.by_ip.get(ip).cloned()
    }

    pub fn remove_ip_ban(&mut self, ip: &str) -> Option<Punishment> {
        self.by_ip.remove(ip)
    }

    pub fn all(&self) -> Vec<Punishment> {
        let mut records: Vec<Punishment> = self.by_target.values().flatten().cloned().collect();
        records.extend(self.by_ip.values().cloned());
        sort_by_creation(&mut records);
        records
    }

    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.by_target.keys().cloned().collect();
        targets.extend(self.by_ip.values().map(|ban| ban.target_id.clone()));
        targets.sort();
        targets.dedup();
        targets
    }

    /// Reflects a deactivation: flips the cached copy and drops it from the
    /// IP index.
    pub fn mark_inactive(&mut self, punishment: &Punishment) {
        if let Some(records) = self.by_target.get_mut(&punishment.target_id) {
            if let Some(cached) = records.iter_mut().find(|cached| cached.id == punishment.id) {
                cached.deactivate();
            }
        }
        self.by_ip.retain(|_, ban| ban.id != punishment.id);
    }

    pub fn len(&self) -> usize {
        self.by_target.values().map(Vec::len).sum::<usize>() + self.by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle to the current [`PunishmentIndex`].
///
/// Readers take an `Arc` of the current snapshot and never hold the lock
/// while reading. Writers either publish a fully built index in one step or
/// copy-on-write the current one, so no reader sees a partial rebuild.
#[derive(Default)]
pub struct PunishmentCache {
    snapshot: RwLock<Arc<PunishmentIndex>>
}

impl PunishmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<PunishmentIndex> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn publish(&self, index: PunishmentIndex) {
        *self.snapshot.write() = Arc::new(index);
    }

    pub fn modify<T, F: FnOnce(&mut PunishmentIndex) -> T>(&self, modify: F) -> T {
        let mut snapshot = self.snapshot.write();
        modify(Arc::make_mut(&mut snapshot))
    }
}
