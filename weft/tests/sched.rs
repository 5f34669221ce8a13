use std::sync::Arc;
use std::time::Duration;

use weft::{
    AimdConfig, AimdController, FairScheduler, QosTier, SchedulerConfig, WindowSource,
};

/// Fixed-window source so scheduler tests control caps independently of
/// AIMD feedback.
struct FixedWindow(u32);

impl WindowSource for FixedWindow {
    fn window(&self, _session: &str) -> u32 {
        self.0
    }
}

/// Adjustable window source for tests that widen caps mid-flight.
struct DynWindow(std::sync::atomic::AtomicU32);

impl DynWindow {
    fn set(&self, window: u32) {
        self.0.store(window, std::sync::atomic::Ordering::Relaxed);
    }
}

impl WindowSource for DynWindow {
    fn window(&self, _session: &str) -> u32 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

fn scheduler(window: u32) -> FairScheduler {
    FairScheduler::new(SchedulerConfig::default(), Arc::new(FixedWindow(window)))
}

#[tokio::test]
async fn fast_path_grants_below_window() {
    let sched = scheduler(4);
    assert!(sched.acquire("a", 4, Duration::ZERO).await);
    assert_eq!(sched.active_count("a").await, 1);
    let stats = sched.stats().await;
    assert_eq!(stats.grants_total, 1);
    assert_eq!(stats.queue_depth, 0);
}

#[tokio::test]
async fn nonblocking_acquire_fails_at_window() {
    let sched = scheduler(1);
    assert!(sched.acquire("a", 1, Duration::ZERO).await);
    assert!(!sched.acquire("a", 1, Duration::ZERO).await);
}

#[tokio::test]
async fn release_grants_the_queued_waiter() {
    let sched = Arc::new(scheduler(1));
    assert!(sched.acquire("a", 1, Duration::ZERO).await);

    let waiter = {
        let sched = Arc::clone(&sched);
        tokio::spawn(async move { sched.acquire("a", 1, Duration::from_secs(5)).await })
    };
    // Let the waiter enqueue before releasing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    sched.release("a").await;
    assert!(waiter.await.unwrap());

    let stats = sched.stats().await;
    assert_eq!(stats.enqueued_total, 1);
    assert_eq!(stats.dequeued_total, 1);
    assert_eq!(stats.dropped_total, 0);
}

#[tokio::test]
async fn queued_acquire_times_out_and_is_dropped() {
    let sched = scheduler(1);
    assert!(sched.acquire("a", 1, Duration::ZERO).await);
    assert!(!sched.acquire("a", 1, Duration::from_millis(50)).await);
    let stats = sched.stats().await;
    assert_eq!(stats.dropped_total, 1);
    assert_eq!(stats.queue_depth, 0);
}

#[tokio::test]
async fn lower_served_over_weight_ratio_wins_the_next_slot() {
    let windows = Arc::new(DynWindow(std::sync::atomic::AtomicU32::new(1)));
    let sched = Arc::new(FairScheduler::new(
        SchedulerConfig::default(),
        Arc::clone(&windows) as Arc<dyn WindowSource>,
    ));
    // "hog" accumulates served count; "light" has a higher weight.
    sched.set_weight("hog", 1.0);
    sched.set_weight("light", 4.0);
    for _ in 0..4 {
        assert!(sched.acquire("hog", 1, Duration::ZERO).await);
        sched.release("hog").await;
    }

    // Both sessions hold their single slot and queue a second request.
    assert!(sched.acquire("hog", 1, Duration::ZERO).await);
    assert!(sched.acquire("light", 1, Duration::ZERO).await);
    let hog = {
        let sched = Arc::clone(&sched);
        tokio::spawn(async move { sched.acquire("hog", 1, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let light = {
        let sched = Arc::clone(&sched);
        tokio::spawn(async move { sched.acquire("light", 1, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Widen the windows so both queued entries are eligible at the next
    // selection: served 1 / weight 4.0 beats served 5 / weight 1.0, so
    // "light" wins despite "hog" queueing first.
    windows.set(2);
    sched.release("hog").await;
    assert!(light.await.unwrap());
    sched.release("light").await;
    assert!(hog.await.unwrap());
}

#[tokio::test]
async fn qos_rank_dominates_when_enabled() {
    let config = SchedulerConfig {
        qos_priority: true,
        ..SchedulerConfig::default()
    };
    let windows = Arc::new(DynWindow(std::sync::atomic::AtomicU32::new(1)));
    let sched = Arc::new(FairScheduler::new(
        config,
        Arc::clone(&windows) as Arc<dyn WindowSource>,
    ));
    sched.set_qos("bronze-session", QosTier::Bronze).await;
    sched.set_qos("gold-session", QosTier::Gold).await;

    assert!(sched.acquire("bronze-session", 1, Duration::ZERO).await);
    assert!(sched.acquire("gold-session", 1, Duration::ZERO).await);
    let bronze = {
        let sched = Arc::clone(&sched);
        tokio::spawn(async move {
            sched.acquire("bronze-session", 1, Duration::from_secs(5)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let gold = {
        let sched = Arc::clone(&sched);
        tokio::spawn(async move {
            sched.acquire("gold-session", 1, Duration::from_secs(5)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // With both queued entries eligible, gold's rank dominates even though
    // bronze queued first and their ratios tie.
    windows.set(2);
    sched.release("bronze-session").await;
    assert!(gold.await.unwrap());
    sched.release("gold-session").await;
    assert!(bronze.await.unwrap());
}

#[tokio::test]
async fn starved_entries_are_promoted_and_boosted() {
    let sched = Arc::new(scheduler(1));
    assert!(sched.acquire("starved", 1, Duration::ZERO).await);

    let waiter = {
        let sched = Arc::clone(&sched);
        tokio::spawn(async move { sched.acquire("starved", 1, Duration::from_secs(10)).await })
    };
    // Wait past the static 50 ms starvation threshold before releasing.
    tokio::time::sleep(Duration::from_millis(120)).await;
    sched.release("starved").await;
    assert!(waiter.await.unwrap());
    assert_eq!(sched.stats().await.starvation_boosts_total, 1);
}

#[tokio::test]
async fn served_counts_and_jains_index_are_exposed() {
    let sched = scheduler(4);
    for _ in 0..3 {
        assert!(sched.acquire("a", 4, Duration::ZERO).await);
        sched.release("a").await;
    }
    for _ in 0..3 {
        assert!(sched.acquire("b", 4, Duration::ZERO).await);
        sched.release("b").await;
    }
    let served = sched.snapshot_served();
    assert_eq!(served.get("a"), Some(&3));
    assert_eq!(served.get("b"), Some(&3));
    let stats = sched.stats().await;
    assert!((stats.jains_index - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn weights_are_floored_at_minimum() {
    let sched = scheduler(1);
    sched.set_weight("a", 0.0);
    assert!((sched.snapshot_weights()["a"] - 0.1).abs() < 1e-9);
}

#[test]
fn aimd_window_drives_scheduler_caps() {
    let aimd = Arc::new(AimdController::new(AimdConfig::default()));
    aimd.feedback("s", 100.0, true);
    let source: Arc<dyn WindowSource> = aimd;
    assert_eq!(source.window("s"), 5);
    assert_eq!(source.window("unknown"), 4);
}
