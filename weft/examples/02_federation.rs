//! Feed peer UPDATEs into the fabric and watch selection react to
//! preferences, dampening, and ECMP.
//!
//! Run with: `cargo run --example 02_federation`

use serde_json::json;
use weft::{Weft, WeftError};

#[tokio::main]
async fn main() -> Result<(), WeftError> {
    tracing_subscriber::fmt()
        .with_env_filter("weft=debug,weft_agp=debug")
        .init();

    let fabric = Weft::builder().router_id("router1:cluster-a").build()?;

    // Two peers announce the same model-class prefix.
    fabric
        .handle_peer_update(
            &json!({
                "type": "UPDATE",
                "announce": [{"prefix": "gpt-class", "attrs": {
                    "path": [65001],
                    "next_hop": "endpoint-a",
                    "local_pref": 300,
                    "health": {"p50_ms": 60.0, "p95_ms": 180.0, "err_rate": 0.005},
                    "cost": {"usd_per_1k_tokens": 0.004},
                }}],
            }),
            "peer-a",
        )
        .await?;
    fabric
        .handle_peer_update(
            &json!({
                "type": "UPDATE",
                "announce": [{"prefix": "gpt-class", "attrs": {
                    "path": [65002, 65003],
                    "next_hop": "endpoint-b",
                    "local_pref": 100,
                    "health": {"p50_ms": 90.0, "p95_ms": 400.0, "err_rate": 0.02},
                    "cost": {"usd_per_1k_tokens": 0.002},
                }}],
            }),
            "peer-b",
        )
        .await?;

    let best = fabric.best_route("gpt-class").await;
    println!(
        "best path: {:?}",
        best.map(|route| route.peer_router_id)
    );

    // A looped announcement is rejected outright.
    let outcome = fabric
        .handle_peer_update(
            &json!({
                "type": "UPDATE",
                "announce": [{"prefix": "gpt-class", "attrs": {
                    "path": [65009],
                    "next_hop": "endpoint-x",
                    "originator_id": "router1:cluster-a",
                }}],
            }),
            "peer-x",
        )
        .await?;
    println!("looped announcement accepted: {}", !outcome.accepted.is_empty());

    // Flap the prefix until dampening suppresses it.
    for _ in 0..3 {
        fabric
            .handle_peer_update(
                &json!({"type": "UPDATE", "withdraw": ["gpt-class"]}),
                "peer-a",
            )
            .await?;
        fabric
            .handle_peer_update(
                &json!({
                    "type": "UPDATE",
                    "announce": [{"prefix": "gpt-class", "attrs": {
                        "path": [65001], "next_hop": "endpoint-a",
                    }}],
                }),
                "peer-a",
            )
            .await?;
    }
    let table = fabric.table().read().await;
    let info = table.get_dampening_info("gpt-class");
    println!(
        "after flapping: penalty={} suppressed={} best={:?}",
        info.penalty,
        info.suppressed,
        table.get_best_route("gpt-class").map(|r| &r.peer_router_id)
    );

    Ok(())
}
