use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use punish_api_rs::{
    config::{BackendKind, DatabaseOptions},
    database::{self, PunishmentBackend, memory::MemoryBackend},
    database::models::punishment::{Punishment, PunishmentType},
    punishment::{LoginDecision, PunishmentManager},
    util::time::{Clock, ManualClock}
};

fn start() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

async fn build_manager(backend: Arc<dyn PunishmentBackend>, clock: Arc<ManualClock>) -> PunishmentManager {
    PunishmentManager::builder(backend).clock(clock).build().await.unwrap()
}

async fn issue(
    manager: &PunishmentManager,
    target: &str,
    kind: PunishmentType,
    duration: Option<i64>,
    ip: Option<&str>
) -> Punishment {
    manager.punish(target, kind, "reason", Some("U1"), duration, ip)
        .await
        .unwrap()
        .issued()
        .unwrap()
}

#[tokio::test]
async fn permanent_ban_is_active() {
    let clock = Arc::new(ManualClock::new(start()));
    let manager = build_manager(Arc::new(MemoryBackend::new()), clock.clone()).await;
    manager.punish("A", PunishmentType::Ban, "cheating", Some("U1"), None, None).await.unwrap();

    let ban = manager.get_active_punishment("A", PunishmentType::Ban).await.unwrap().unwrap();
    assert_eq!(ban.kind, PunishmentType::Ban);
    assert_eq!(ban.reason, "cheating");
    assert!(ban.is_active());
    assert!(!ban.is_expired_at(clock.now()));
    assert!(matches!(manager.check_login("A", None).await, LoginDecision::Denied(_)));
}

#[tokio::test]
async fn temp_ban_lapses_without_a_sweep() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(start()));
    let manager = build_manager(backend.clone(), clock.clone()).await;
    let ban = issue(&manager, "B", PunishmentType::TempBan, Some(5), None).await;

    assert!(!ban.is_expired_at(start()));
    assert!(manager.get_active_punishment("B", PunishmentType::Ban).await.unwrap().is_some());

    clock.advance(6);
    assert!(ban.is_expired_at(start() + chrono::Duration::seconds(6)));
    assert!(manager.get_active_punishment("B", PunishmentType::Ban).await.unwrap().is_none());
    // still active in storage until something deactivates it
    assert!(backend.load_for_target("B").await.unwrap()[0].is_active());
    assert_eq!(manager.check_login("B", None).await, LoginDecision::Allowed);
}

#[tokio::test]
async fn ip_ban_round_trip() {
    let clock = Arc::new(ManualClock::new(start()));
    let manager = build_manager(Arc::new(MemoryBackend::new()), clock).await;
    let ban = issue(&manager, "C", PunishmentType::IpBan, None, Some("10.0.0.5")).await;

    assert!(manager.is_ip_banned("10.0.0.5").await);
    assert_eq!(manager.get_ip_ban("10.0.0.5").await.unwrap(), Some(ban.clone()));
    assert_eq!(manager.check_login("someone-else", Some("10.0.0.5")).await, LoginDecision::Denied(ban));

    let lifted = manager.remove_ip_ban("10.0.0.5").await.unwrap().unwrap();
    assert!(!lifted.is_active());
    assert!(!manager.is_ip_banned("10.0.0.5").await);
    assert!(manager.remove_ip_ban("10.0.0.5").await.unwrap().is_none());
}

#[tokio::test]
async fn reban_after_lapsed_ip_ban_is_enforced() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(start()));
    let manager = build_manager(backend.clone(), clock.clone()).await;
    let lapsed = issue(&manager, "C", PunishmentType::IpBan, Some(60), Some("10.0.0.5")).await;

    clock.advance(120);
    assert!(!manager.is_ip_banned("10.0.0.5").await);
    let reban = issue(&manager, "C", PunishmentType::IpBan, None, Some("10.0.0.5")).await;

    assert_eq!(backend.load_for_ip("10.0.0.5").await.unwrap().len(), 2);
    assert!(manager.is_ip_banned("10.0.0.5").await);
    assert_eq!(manager.get_ip_ban("10.0.0.5").await.unwrap(), Some(reban.clone()));
    assert_eq!(manager.check_login("other", Some("10.0.0.5")).await, LoginDecision::Denied(reban.clone()));

    // lifting removes the enforced ban, not the lapsed one
    let lifted = manager.remove_ip_ban("10.0.0.5").await.unwrap().unwrap();
    assert_eq!(lifted.id, reban.id);
    assert!(!manager.is_ip_banned("10.0.0.5").await);
    assert_eq!(backend.load_for_ip("10.0.0.5").await.unwrap(), vec![lapsed]);
}

#[tokio::test]
async fn duplicate_bans_resolve_to_the_earliest() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(start()));
    let manager = build_manager(backend.clone(), clock.clone()).await;
    let first = issue(&manager, "D", PunishmentType::Ban, None, None).await;
    clock.advance(1);
    issue(&manager, "D", PunishmentType::TempBan, Some(3_600), None).await;

    assert_eq!(backend.load_all_active().await.unwrap().len(), 2);
    for _ in 0..3 {
        let active = manager.get_active_punishment("D", PunishmentType::Ban).await.unwrap().unwrap();
        assert_eq!(active.id, first.id);
    }
}

#[tokio::test]
async fn removal_is_visible_in_history() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(start()));
    let manager = build_manager(backend.clone(), clock).await;
    let ban = issue(&manager, "E", PunishmentType::Ban, None, None).await;

    let lifted = manager.remove_punishment("E", PunishmentType::Ban).await.unwrap().unwrap();
    assert_eq!(lifted.id, ban.id);
    assert!(manager.get_active_punishment("E", PunishmentType::Ban).await.unwrap().is_none());

    let history = manager.get_player_punishments("E");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, ban.id);
    assert!(!history[0].is_active());
}

#[tokio::test]
async fn sweep_only_touches_expired_records() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(start()));
    let manager = build_manager(backend.clone(), clock.clone()).await;
    let short = issue(&manager, "F", PunishmentType::Mute, Some(30), None).await;
    let long = issue(&manager, "F", PunishmentType::TempBan, Some(3_600), None).await;
    let permanent = issue(&manager, "G", PunishmentType::Ban, None, None).await;

    clock.advance(31);
    assert_eq!(manager.cleanup_expired_punishments().await, 1);

    let active_ids: Vec<String> = backend.load_all_active().await.unwrap().into_iter().map(|p| p.id).collect();
    assert!(!active_ids.contains(&short.id));
    assert!(active_ids.contains(&long.id));
    assert!(active_ids.contains(&permanent.id));
    assert!(manager.check_chat("F").await.is_none());

    let cached = manager.get_all_punishments();
    assert!(cached.iter().any(|p| p.id == short.id && !p.is_active()));
    assert!(cached.iter().filter(|p| p.id != short.id).all(Punishment::is_active));
}

#[tokio::test]
async fn reload_picks_up_records_from_other_writers() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(start()));
    let manager = build_manager(backend.clone(), clock).await;
    assert!(manager.get_player_punishments("H").is_empty());

    let elsewhere = Punishment::new("H", PunishmentType::Mute, "spam", None, None, None, start());
    backend.save(&elsewhere).await.unwrap();
    let loaded = manager.reload_player_punishments("H").await.unwrap();
    assert_eq!(loaded, vec![elsewhere.clone()]);
    assert_eq!(manager.get_player_punishments("H"), vec![elsewhere]);
}

#[tokio::test]
async fn sqlite_backed_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let options = DatabaseOptions {
        kind: BackendKind::Sqlite,
        sqlite_path: dir.path().join("punishments.db").to_str().unwrap().to_owned(),
        ..DatabaseOptions::default()
    };
    let clock = Arc::new(ManualClock::new(start()));

    let backend = database::connect(&options).await.unwrap();
    let manager = build_manager(Arc::clone(&backend), clock.clone()).await;
    let ban = issue(&manager, "I", PunishmentType::Ban, None, None).await;
    clock.advance(1);
    let mute = issue(&manager, "I", PunishmentType::Mute, Some(10), None).await;
    issue(&manager, "J", PunishmentType::IpBan, None, Some("10.0.0.8")).await;

    assert_eq!(backend.load_for_target("I").await.unwrap(), vec![ban.clone(), mute.clone()]);
    assert!(manager.is_ip_banned("10.0.0.8").await);

    clock.advance(11);
    assert_eq!(manager.cleanup_expired_punishments().await, 1);
    manager.remove_punishment("I", PunishmentType::Ban).await.unwrap();
    manager.shutdown().await;

    // a fresh process sees what the first one left behind
    let backend = database::connect(&options).await.unwrap();
    let manager = build_manager(backend, clock).await;
    assert!(manager.get_active_punishment("I", PunishmentType::Ban).await.unwrap().is_none());
    assert!(manager.check_chat("I").await.is_none());
    assert!(manager.is_ip_banned("10.0.0.8").await);
    manager.shutdown().await;
}
