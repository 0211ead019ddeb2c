//! Integration tests for component interactions.
//!
//! These tests drive the guards, hedging and the manager together through the
//! public crate APIs.

use autopilot_core::types::{PositionSide, TradeIntent, TradeSettlement, TradingMode};
use autopilot_core::{ErrorKind, MemorySettingsStore, OwnershipMode, SettingsKey, SettingsStore};
use autopilot_engine::{
    AutopilotManager, InstanceDeps, InstanceOptions, ManagerOptions, PaperClientFactory,
    PersistenceQueue, StartOutcome, StopOutcome,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

struct Harness {
    manager: Arc<AutopilotManager>,
    factory: Arc<PaperClientFactory>,
    store: Arc<MemorySettingsStore>,
    persistence: Arc<PersistenceQueue>,
}

fn harness(mode: OwnershipMode) -> Harness {
    let store = Arc::new(MemorySettingsStore::new());
    let factory = Arc::new(PaperClientFactory::new(Decimal::new(10_000, 0)));
    let persistence = Arc::new(PersistenceQueue::spawn(store.clone(), 64));
    let deps = InstanceDeps {
        store: store.clone(),
        persistence: persistence.clone(),
        factory: factory.clone(),
    };
    let options = ManagerOptions {
        ownership_mode: mode,
        retention: ChronoDuration::minutes(30),
        cleanup_interval: Duration::from_secs(300),
        instance: InstanceOptions {
            exchange_timeout: Duration::from_millis(500),
            loop_interval: Duration::from_secs(3600),
            stop_timeout: Duration::from_secs(1),
            ..InstanceOptions::default()
        },
    };
    Harness {
        manager: AutopilotManager::new(options, deps),
        factory,
        store,
        persistence,
    }
}

fn intent(symbol: &str, mode: TradingMode, notional: i64) -> TradeIntent {
    TradeIntent::new(
        symbol,
        mode,
        PositionSide::Long,
        Decimal::new(notional, 0),
        Decimal::new(100, 0),
    )
}

fn loss(symbol: &str, pnl: i64) -> TradeSettlement {
    TradeSettlement {
        intent_id: None,
        symbol: symbol.to_string(),
        mode: TradingMode::Swing,
        notional_usd: Decimal::new(100, 0),
        realized_pnl: Decimal::new(pnl, 0),
        pnl_percent: Decimal::new(pnl, 3),
        settled_at: Utc::now(),
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Daily loss of 320 against a 300 limit halts trading until the cooldown ends.
#[test]
fn test_daily_loss_breaker_cooldown() {
    use risk_manager::{CircuitBreaker, CircuitBreakerConfig};

    let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
        max_loss_per_hour: Decimal::ZERO,
        max_daily_loss: Decimal::new(300, 0),
        max_consecutive_losses: 0,
        cooldown_minutes: 30,
        ..Default::default()
    });

    for (i, pnl) in [-100, -80, -90, -50].iter().enumerate() {
        breaker.record_outcome_at(
            Decimal::new(*pnl, 0),
            t0() + ChronoDuration::minutes(i as i64),
        );
    }
    let last = t0() + ChronoDuration::minutes(3);

    assert_eq!(breaker.evaluate_at(last).code(), Some("max_daily_loss"));
    assert!(breaker
        .evaluate_at(last + ChronoDuration::minutes(30))
        .is_allowed());
}

/// Settlements recorded through an instance trip its breaker and block the next intent.
#[tokio::test]
async fn test_settlements_halt_instance() {
    use risk_manager::CircuitBreakerConfig;

    let h = harness(OwnershipMode::Dedicated);
    let instance = h.manager.get_or_create_instance("alice").await;
    assert_ok!(
        instance
            .update_circuit_breaker_config(
                "alice",
                CircuitBreakerConfig {
                    max_loss_per_hour: Decimal::ZERO,
                    max_daily_loss: Decimal::new(300, 0),
                    max_consecutive_losses: 0,
                    ..Default::default()
                },
            )
            .await
    );

    for pnl in [-100, -80, -90, -50] {
        instance.record_settlement(&loss("BTCUSDT", pnl)).await;
    }

    let verdict = instance
        .submit_intent("alice", &intent("ETHUSDT", TradingMode::Swing, 100))
        .await
        .unwrap();
    assert_eq!(verdict.code(), Some("max_daily_loss"));
    let status = h.manager.instance_status("alice").await;
    assert!(status.instance.unwrap().trading_halted);

    // The tripped state reaches storage.
    h.persistence.flush().await;
    let stored = h
        .store
        .load("alice", SettingsKey::CircuitBreaker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["state"]["tripped"], serde_json::json!(true));

    instance.reset_circuit_breaker("alice").await.unwrap();
    let verdict = instance
        .submit_intent("alice", &intent("ETHUSDT", TradingMode::Swing, 100))
        .await
        .unwrap();
    assert!(verdict.is_allowed());
}

/// Hedge size above the configured cap is rejected; a smaller one sizes off the position.
#[tokio::test]
async fn test_hedge_size_cap() {
    use autopilot_core::types::Position;
    use risk_manager::{HedgeConfig, HedgeTrigger, HedgingManager};

    let manager = HedgingManager::new(HedgeConfig {
        enabled: true,
        max_hedge_size_percent: Decimal::new(50, 0),
        ..Default::default()
    });
    let position = Position::new(
        "BTCUSDT",
        PositionSide::Long,
        Decimal::new(10, 0),
        Decimal::new(100, 0),
    )
    .with_mark(Decimal::new(94, 0));

    let rejected = manager
        .execute_hedge("BTCUSDT", &position, Decimal::new(60, 0), HedgeTrigger::Manual, true)
        .await;
    assert_eq!(rejected.unwrap_err().kind(), ErrorKind::Validation);

    let record = manager
        .execute_hedge("BTCUSDT", &position, Decimal::new(40, 0), HedgeTrigger::Manual, true)
        .await
        .unwrap();
    assert_eq!(record.hedge_quantity, Decimal::new(4, 0));
    assert_eq!(record.hedge_side, PositionSide::Short);
}

/// Scalp holds 30% of 10,000: after 2,800 is booked a 500 request is denied.
#[tokio::test]
async fn test_scalp_capacity_through_instance() {
    let h = harness(OwnershipMode::Dedicated);
    let instance = h.manager.get_or_create_instance("alice").await;

    // Scalp positions are capped at 600 each, so 2,800 is booked in five fills.
    for symbol in ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "BNBUSDT"] {
        let verdict = instance
            .submit_intent("alice", &intent(symbol, TradingMode::Scalp, 560))
            .await
            .unwrap();
        assert!(verdict.is_allowed());
    }

    let second = instance
        .submit_intent("alice", &intent("ADAUSDT", TradingMode::Scalp, 500))
        .await
        .unwrap();
    assert_eq!(second.code(), Some("mode_capacity"));

    // Other modes keep their own budget.
    let swing = instance
        .submit_intent("alice", &intent("ETHUSDT", TradingMode::Swing, 500))
        .await
        .unwrap();
    assert!(swing.is_allowed());
}

/// Two simultaneous starts on an unclaimed controller: one owner, one informational reply.
#[tokio::test]
async fn test_concurrent_start_on_unclaimed_instance() {
    let h = harness(OwnershipMode::Shared);

    let (a, b) = tokio::join!(
        h.manager.start_autopilot("alice"),
        h.manager.start_autopilot("alice")
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, StartOutcome::AlreadyRunning { .. }));

    assert_eq!(outcomes[0], StartOutcome::Started);
    assert_eq!(
        outcomes[1],
        StartOutcome::AlreadyRunning {
            owner: Some("alice".to_string())
        }
    );
    assert_eq!(h.manager.running_users().await, vec!["alice".to_string()]);

    h.manager.shutdown().await;
}

/// A non-owner can read status but cannot mutate or stop a shared controller.
#[tokio::test]
async fn test_non_owner_denied_in_shared_mode() {
    let h = harness(OwnershipMode::Shared);
    h.manager.start_autopilot("alice").await.unwrap();
    let instance = h.manager.get_or_create_instance("bob").await;

    let err = h.manager.stop_autopilot("bob").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(err.status_code(), 403);

    let err = instance.halt_trading("bob", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let status = h.manager.instance_status("bob").await;
    assert!(status.exists);
    assert_eq!(status.instance.unwrap().owner.as_deref(), Some("alice"));

    assert_eq!(
        h.manager.stop_autopilot("alice").await.unwrap(),
        StopOutcome::Stopped
    );
    assert_eq!(
        h.manager.start_autopilot("bob").await.unwrap(),
        StartOutcome::Started
    );
    h.manager.shutdown().await;
}

/// Live trading without credentials is reported as not configured.
#[tokio::test]
async fn test_live_start_requires_credentials() {
    let h = harness(OwnershipMode::Dedicated);
    let instance = h.manager.get_or_create_instance("alice").await;
    instance.set_dry_run("alice", false).await.unwrap();

    let err = h.manager.start_autopilot("alice").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConfigured);
    assert_eq!(err.status_code(), 503);
    assert!(!h.manager.is_running("alice"));

    h.factory.set_credentials("alice", "key-1");
    assert_eq!(
        h.manager.start_autopilot("alice").await.unwrap(),
        StartOutcome::Started
    );
    h.manager.shutdown().await;
}

/// The background loop consumes intents and stops cleanly on shutdown.
#[tokio::test]
async fn test_running_loop_places_paper_orders() {
    let store = Arc::new(MemorySettingsStore::new());
    let factory = Arc::new(PaperClientFactory::new(Decimal::new(10_000, 0)));
    let deps = InstanceDeps {
        store: store.clone(),
        persistence: Arc::new(PersistenceQueue::spawn(store, 16)),
        factory: factory.clone(),
    };
    let options = ManagerOptions {
        ownership_mode: OwnershipMode::Dedicated,
        instance: InstanceOptions {
            loop_interval: Duration::from_millis(20),
            ..InstanceOptions::default()
        },
        ..ManagerOptions::default()
    };
    let manager = AutopilotManager::new(options, deps);

    factory.set_credentials("alice", "key-1");
    factory
        .exchange_for("alice")
        .set_price("BTCUSDT", Decimal::new(100, 0))
        .await;
    let instance = manager.get_or_create_instance("alice").await;
    instance.set_dry_run("alice", false).await.unwrap();
    manager.start_autopilot("alice").await.unwrap();

    factory
        .decision_client_for("alice")
        .push_intent(intent("BTCUSDT", TradingMode::Swing, 200))
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(factory.exchange_for("alice").order_count().await, 1);
    let verdicts = factory.decision_client_for("alice").verdicts().await;
    assert_eq!(verdicts.len(), 1);
    assert!(verdicts[0].1.is_allowed());

    manager.shutdown().await;
    assert!(!manager.is_running("alice"));
}
