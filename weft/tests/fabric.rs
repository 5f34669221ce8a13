use std::sync::Arc;
use std::time::Duration;

use weft::{
    DispatchBudget, DispatchRequest, PersonaSpec, QosTier, ReconciliationPolicy, SessionState,
    Weft, WeftError,
};
use weft_mock::MockWorker;

fn request(session_id: &str, personas: &[&str]) -> DispatchRequest {
    DispatchRequest {
        session_id: session_id.to_string(),
        personas: personas
            .iter()
            .map(|p| PersonaSpec::single(*p))
            .collect(),
        policy: ReconciliationPolicy::FirstWin,
        qos: QosTier::Silver,
        budget: DispatchBudget {
            tokens: 1000,
            dollars: 0.5,
        },
        latency_slo_ms: 2000.0,
        admission_timeout: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn end_to_end_first_win_dispatch() {
    let fabric = Weft::builder()
        .with_worker(Arc::new(
            MockWorker::new("doctor-1", &["Medical", " advice"]),
        ))
        .with_worker(Arc::new(
            MockWorker::new("lawyer-1", &["Legal", " advice"])
                .chunk_delay(Duration::from_millis(30)),
        ))
        .build()
        .unwrap();

    let outcome = fabric
        .dispatch_parallel(request("session-1", &["doctor-1", "lawyer-1"]))
        .await
        .unwrap();
    assert_eq!(outcome.policy, "first-win");
    assert_eq!(outcome.winning_persona.as_deref(), Some("doctor-1"));
    assert_eq!(outcome.result, "Medical advice");

    let sessions = fabric.sessions().lock().await;
    let session = sessions.get_session("session-1").unwrap();
    assert_eq!(session.state(), SessionState::Complete);
}

#[tokio::test]
async fn out_of_order_worker_stream_is_reassembled() {
    let fabric = Weft::builder()
        .with_worker(Arc::new(
            MockWorker::new("doctor-1", &["one ", "two ", "three"]).emit_order(&[2, 0, 1]),
        ))
        .build()
        .unwrap();

    let outcome = fabric
        .dispatch_parallel(request("session-2", &["doctor-1"]))
        .await
        .unwrap();
    assert_eq!(outcome.result, "one two three");
}

#[tokio::test]
async fn clone_fan_out_allocates_distinct_clone_ids() {
    let fabric = Weft::builder()
        .with_worker(Arc::new(MockWorker::new("doctor-1", &["out"])))
        .build()
        .unwrap();

    let mut req = request("session-3", &[]);
    req.personas = vec![PersonaSpec {
        persona_id: "doctor-1".to_string(),
        count: 3,
    }];
    fabric.dispatch_parallel(req).await.unwrap();

    let sessions = fabric.sessions().lock().await;
    let session = sessions.get_session("session-3").unwrap();
    let clone_ids: Vec<u64> = session
        .personas
        .iter()
        .filter_map(|slot| slot.clone_id)
        .collect();
    assert_eq!(clone_ids, vec![1, 2, 3]);
    assert!(session.personas.iter().all(|slot| slot.completed));
}

#[tokio::test]
async fn unknown_persona_is_rejected() {
    let fabric = Weft::builder()
        .with_worker(Arc::new(MockWorker::new("doctor-1", &["out"])))
        .build()
        .unwrap();
    let err = fabric
        .dispatch_parallel(request("session-4", &["nonexistent"]))
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::Worker { .. }));
}

#[tokio::test]
async fn qos_mismatch_is_rejected() {
    let fabric = Weft::builder()
        .with_worker(Arc::new(
            MockWorker::new("doctor-1", &["out"]).min_qos(QosTier::Gold),
        ))
        .build()
        .unwrap();
    let mut req = request("session-5", &["doctor-1"]);
    req.qos = QosTier::Bronze;
    let err = fabric.dispatch_parallel(req).await.unwrap_err();
    assert!(matches!(err, WeftError::Worker { .. }));
}

#[tokio::test]
async fn slo_hard_cap_cancels_runaway_generation() {
    let fabric = Weft::builder()
        .with_worker(Arc::new(
            MockWorker::new("doctor-1", &["slow", "slower"])
                .chunk_delay(Duration::from_millis(400)),
        ))
        .build()
        .unwrap();

    // 4x a 50 ms SLO is 200 ms; the worker needs ~800 ms.
    let mut req = request("session-6", &["doctor-1"]);
    req.latency_slo_ms = 50.0;
    let err = fabric.dispatch_parallel(req).await.unwrap_err();
    assert!(matches!(err, WeftError::Cancelled { .. }));

    // The failed dispatch fed negative AIMD feedback.
    assert!(fabric.aimd().get("session-6") < 4);
}

#[tokio::test]
async fn scheduler_slot_is_released_after_dispatch() {
    let fabric = Weft::builder()
        .with_worker(Arc::new(MockWorker::new("doctor-1", &["out"])))
        .build()
        .unwrap();
    fabric
        .dispatch_parallel(request("session-7", &["doctor-1"]))
        .await
        .unwrap();
    assert_eq!(fabric.scheduler().active_count("session-7").await, 0);
    // Successful fast dispatch grew the window additively.
    assert_eq!(fabric.aimd().get("session-7"), 5);
}

#[tokio::test]
async fn peer_updates_feed_route_selection() {
    let fabric = Weft::builder().router_id("router1:cluster-a").build().unwrap();
    // Two peers announce the same prefix with different preferences.
    let message = serde_json::json!({
        "type": "UPDATE",
        "announce": [{"prefix": "gpt-class", "attrs": {
            "path": [65001], "next_hop": "peer-a", "local_pref": 100,
        }}],
    });
    fabric.handle_peer_update(&message, "peer-a").await.unwrap();
    let better = serde_json::json!({
        "type": "UPDATE",
        "announce": [{"prefix": "gpt-class", "attrs": {
            "path": [65002], "next_hop": "peer-b", "local_pref": 900,
        }}],
    });
    fabric.handle_peer_update(&better, "peer-b").await.unwrap();

    let best = fabric.best_route("gpt-class").await.unwrap();
    assert_eq!(best.peer_router_id, "peer-b");
    assert!(
        fabric
            .select_route("gpt-class", "some-session", None)
            .await
            .is_some()
    );
}

#[tokio::test]
async fn audited_fabric_writes_a_verifiable_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let fabric = Weft::builder()
        .with_worker(Arc::new(MockWorker::new("doctor-1", &["out"])))
        .audit_log(&path, b"fabric-secret".to_vec())
        .build()
        .unwrap();
    fabric
        .dispatch_parallel(request("session-8", &["doctor-1"]))
        .await
        .unwrap();

    let terminal = weft::audit::verify_chain(&path, b"fabric-secret").unwrap();
    assert!(terminal.is_some());
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("session_created"));
    assert!(contents.contains("reconciliation_complete"));
}

#[tokio::test]
async fn maintenance_task_sweeps_until_shutdown() {
    let fabric = Arc::new(
        Weft::builder()
            .with_worker(Arc::new(MockWorker::new("doctor-1", &["out"])))
            .build()
            .unwrap(),
    );
    fabric
        .dispatch_parallel(request("session-10", &["doctor-1"]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let handle = fabric.spawn_maintenance(Duration::from_millis(10), 0.0, 3600.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;
    assert_eq!(fabric.sessions().lock().await.active_sessions(), 0);
}

#[tokio::test]
async fn maintenance_sweep_prunes_expired_state() {
    let fabric = Arc::new(
        Weft::builder()
            .with_worker(Arc::new(MockWorker::new("doctor-1", &["out"])))
            .build()
            .unwrap(),
    );
    fabric
        .dispatch_parallel(request("session-9", &["doctor-1"]))
        .await
        .unwrap();
    assert_eq!(fabric.sessions().lock().await.active_sessions(), 1);

    // A sweep with a zero max-age reaps the completed session.
    tokio::time::sleep(Duration::from_millis(5)).await;
    fabric.run_maintenance_once(0.0, 3600.0).await;
    assert_eq!(fabric.sessions().lock().await.active_sessions(), 0);
}
