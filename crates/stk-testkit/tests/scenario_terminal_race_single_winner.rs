use std::sync::Arc;

use stk_schemas::InventoryError;
use stk_store::StockStore;
use stk_testkit::{t0, Harness};

/// Release and commit racing on the same reservation: exactly one performs
/// the ledger effect; the other observes the terminal state (release
/// no-ops, commit reports InvalidState). Repeated across many rounds the
/// books must still balance exactly.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn release_and_commit_race_has_one_winner() {
    let harness = Arc::new(Harness::new());
    let product = harness.seed("p-1", 100, 0, 0).await;

    let mut commits = 0i64;
    for round in 0..20 {
        let id = format!("r-{round}");
        harness
            .service
            .reserve(&product, 1, Some(id.clone()), None, t0())
            .await
            .unwrap();

        let releaser = {
            let harness = harness.clone();
            let id = id.clone();
            tokio::spawn(async move { harness.service.release(&id, t0()).await })
        };
        let committer = {
            let harness = harness.clone();
            let id = id.clone();
            tokio::spawn(async move {
                harness
                    .service
                    .commit_reservation(&id, "order_race", t0())
                    .await
            })
        };

        let released = releaser.await.expect("join");
        let committed = committer.await.expect("join");

        match (released, committed) {
            // Release won: commit must see the terminal state.
            (Ok(1), Err(InventoryError::InvalidState { .. })) => {}
            // Commit won: release must be a zero no-op.
            (Ok(0), Ok(_)) => commits += 1,
            other => panic!("round {round}: inconsistent race outcome {other:?}"),
        }
    }

    let record = harness.store.load_stock(&product).await.unwrap();
    assert_eq!(record.reserved_quantity, 0, "every hold settled exactly once");
    assert_eq!(record.total_quantity, 100 - commits);
    assert!(record.invariant_holds());
}

/// The sweep racing an explicit release also settles exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_and_release_race_has_one_winner() {
    let harness = Arc::new(Harness::new());
    let product = harness.seed("p-1", 50, 0, 0).await;

    for round in 0..10 {
        let id = format!("r-{round}");
        harness
            .service
            .reserve(
                &product,
                2,
                Some(id.clone()),
                Some(chrono::Duration::seconds(1)),
                t0(),
            )
            .await
            .unwrap();

        let sweeper = {
            let harness = harness.clone();
            tokio::spawn(async move { harness.service.expire_sweep(stk_testkit::at(5)).await })
        };
        let releaser = {
            let harness = harness.clone();
            let id = id.clone();
            tokio::spawn(async move { harness.service.release(&id, stk_testkit::at(5)).await })
        };

        let swept = sweeper.await.expect("join").unwrap();
        let released = releaser.await.expect("join").unwrap();
        assert!(
            (swept.reclaimed_quantity == 2 && released == 0)
                || (swept.reclaimed_quantity == 0 && released == 2),
            "round {round}: reclaimed {} and released {released}",
            swept.reclaimed_quantity
        );
    }

    let record = harness.store.load_stock(&product).await.unwrap();
    assert_eq!(record.reserved_quantity, 0);
    assert_eq!(record.total_quantity, 50);
}
