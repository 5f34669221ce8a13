//! Fan a request out to two personas and reconcile under two policies.
//!
//! Run with: `cargo run --example 01_parallel_dispatch`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use weft::{
    DispatchBudget, DispatchRequest, PersonaSpec, QosTier, ReconciliationPolicy, Weft, WeftError,
};
use weft_mock::MockWorker;

#[tokio::main]
async fn main() -> Result<(), WeftError> {
    tracing_subscriber::fmt()
        .with_env_filter("weft=debug")
        .init();

    let fabric = Weft::builder()
        .with_worker(Arc::new(MockWorker::new(
            "doctor-1",
            &["Take", " two", " aspirin."],
        )))
        .with_worker(Arc::new(
            MockWorker::new("lawyer-1", &["Consult", " counsel", " first."])
                .chunk_delay(Duration::from_millis(25)),
        ))
        .build()?;

    let base = DispatchRequest {
        session_id: "demo-first-win".to_string(),
        personas: vec![
            PersonaSpec::single("doctor-1"),
            PersonaSpec::single("lawyer-1"),
        ],
        policy: ReconciliationPolicy::FirstWin,
        qos: QosTier::Silver,
        budget: DispatchBudget {
            tokens: 500,
            dollars: 0.25,
        },
        latency_slo_ms: 2000.0,
        admission_timeout: Duration::from_millis(250),
    };

    let outcome = fabric.dispatch_parallel(base.clone()).await?;
    println!(
        "first-win: {:?} won with {:?}",
        outcome.winning_persona, outcome.result
    );

    let mut weights = HashMap::new();
    weights.insert("doctor-1".to_string(), 2.0);
    weights.insert("lawyer-1".to_string(), 1.0);
    let merged = fabric
        .dispatch_parallel(DispatchRequest {
            session_id: "demo-weighted".to_string(),
            policy: ReconciliationPolicy::WeightedMerge { weights },
            ..base
        })
        .await?;
    println!(
        "weighted-merge (total weight {:?}): {}",
        merged.total_weight, merged.result
    );

    Ok(())
}
