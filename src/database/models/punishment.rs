use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Deserialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::util::time::{format_compound_duration, truncate_to_millis};

// chrono::Duration::seconds panics past this bound
const MAX_DURATION_SECONDS: i64 = i64::MAX / 2_000;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Punishment {
    pub id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub kind: PunishmentType,
    pub reason: String,
    #[serde(default)]
    pub issuer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub banned_ip: Option<String>,
    active: bool
}

impl Punishment {
    /// Builds a fresh, active punishment. `created_at` is truncated to
    /// millisecond precision so every backend stores it losslessly.
    pub fn new(
        target_id: &str,
        kind: PunishmentType,
        reason: &str,
        issuer_id: Option<&str>,
        duration: Option<i64>,
        banned_ip: Option<String>,
        now: DateTime<Utc>
    ) -> Self {
        Punishment {
            id: Uuid::new_v4().to_string(),
            target_id: target_id.to_owned(),
            kind,
            reason: reason.to_owned(),
            issuer_id: issuer_id.map(str::to_owned),
            created_at: truncate_to_millis(now),
            duration,
            banned_ip,
            active: true
        }
    }

    /// Rebuilds a punishment exactly as a backend stored it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: String,
        target_id: String,
        kind: PunishmentType,
        reason: String,
        issuer_id: Option<String>,
        created_at: DateTime<Utc>,
        duration: Option<i64>,
        banned_ip: Option<String>,
        active: bool
    ) -> Self {
        Punishment { id, target_id, kind, reason, issuer_id, created_at, duration, banned_ip, active }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Flips the record to inactive. Returns false if it already was, so the
    /// caller knows there is nothing to persist.
    pub fn deactivate(&mut self) -> bool {
        let was_active = self.active;
        self.active = false;
        was_active
    }

    pub fn is_permanent(&self) -> bool {
        match self.duration {
            None => true,
            Some(seconds) => seconds <= 0
        }
    }

    pub fn expiration_time(&self) -> Option<DateTime<Utc>> {
        if self.is_permanent() {
            return None;
        }
        let seconds = self.duration.unwrap_or(0).min(MAX_DURATION_SECONDS);
        self.created_at.checked_add_signed(Duration::seconds(seconds))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return true;
        }
        match self.expiration_time() {
            Some(expiration) => now > expiration,
            None => false
        }
    }

    /// Active in storage and not yet past its window.
    pub fn is_enforced_at(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired_at(now)
    }

    pub fn is_console_issued(&self) -> bool {
        self.issuer_id.is_none()
    }

    pub fn formatted_duration(&self) -> String {
        if self.is_permanent() {
            return String::from("Permanent");
        }
        format_compound_duration(self.duration.unwrap_or(0))
    }

    pub fn formatted_time_left(&self, now: DateTime<Utc>) -> String {
        if self.is_permanent() {
            return String::from("Permanent");
        }
        if self.is_expired_at(now) {
            return String::from("Expired");
        }
        match self.expiration_time() {
            Some(expiration) => format_compound_duration((expiration - now).num_seconds()),
            None => String::from("Permanent")
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PunishmentType {
    Ban,
    TempBan,
    Mute,
    Kick,
    IpBan
}

impl PunishmentType {
    /// Whether a stored record of this type answers a lookup for `requested`.
    /// A BAN lookup covers temporary bans as well.
    pub fn satisfies(&self, requested: PunishmentType) -> bool {
        match requested {
            PunishmentType::Ban => matches!(self, PunishmentType::Ban | PunishmentType::TempBan),
            other => *self == other
        }
    }

    /// Types whose enforcement ends the target's live session.
    pub fn ends_session(&self) -> bool {
        !matches!(self, PunishmentType::Mute)
    }
}
