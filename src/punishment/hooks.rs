use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::database::models::punishment::Punishment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Veto
}

/// Observes the punishment lifecycle. Called synchronously on the task that
/// drives the manager, so implementations must not block.
pub trait PunishmentListener: Send + Sync {
    /// Offered every punishment before anything is persisted. Any `Veto`
    /// cancels the punishment outright.
    fn before_commit(&self, _punishment: &Punishment) -> Verdict {
        Verdict::Proceed
    }

    fn after_deactivate(&self, _punishment: &Punishment) {}
}

/// What the session layer has to do once a punishment is accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum Enforcement {
    /// End the target's live session.
    Disconnect(Punishment),
    /// Remember the mute for chat checks; the session stays up.
    Mute(Punishment)
}

impl Enforcement {
    pub fn for_punishment(punishment: &Punishment) -> Self {
        if punishment.kind.ends_session() {
            Enforcement::Disconnect(punishment.clone())
        } else {
            Enforcement::Mute(punishment.clone())
        }
    }

    pub fn punishment(&self) -> &Punishment {
        match self {
            Enforcement::Disconnect(punishment) | Enforcement::Mute(punishment) => punishment
        }
    }
}

pub trait Enforcer: Send + Sync {
    fn enforce(&self, enforcement: Enforcement);
}

/// Hands enforcement to whichever task owns the sessions.
pub struct ChannelEnforcer {
    sender: UnboundedSender<Enforcement>
}

impl ChannelEnforcer {
    pub fn channel() -> (Self, UnboundedReceiver<Enforcement>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelEnforcer { sender }, receiver)
    }
}

impl Enforcer for ChannelEnforcer {
    fn enforce(&self, enforcement: Enforcement) {
        if let Err(e) = self.sender.send(enforcement) {
            warn!("Dropping enforcement for {}: session consumer has stopped", e.0.punishment().target_id);
        }
    }
}

pub struct NoopEnforcer;

impl Enforcer for NoopEnforcer {
    fn enforce(&self, _enforcement: Enforcement) {}
}
