use stk_schemas::{InventoryError, Severity};
use stk_store::{AlertStore, StockStore};
use stk_testkit::{t0, Harness};

/// The full checkout contract on a nearly depleted product:
/// total=2, reserved=0, low threshold=5.
///
/// - reserve 1 (R1) succeeds; available drops to 1; a LOW alert fires
///   because total <= threshold regardless of the reservation.
/// - reserve 2 (R2) fails InsufficientStock (only 1 available).
/// - commit R1: total 1, reserved 0.
/// - release R1 on the now-committed reservation: successful no-op.
#[tokio::test]
async fn checkout_flow_on_low_stock_product() {
    let harness = Harness::new();
    let product = harness.seed("p-1", 2, 5, 0).await;

    // Checkout asks first.
    let availability = harness
        .service
        .check_availability(&product, 1)
        .await
        .unwrap();
    assert!(availability.can_fulfill);
    assert!(availability.low_stock, "total 2 <= threshold 5");

    // R1 holds one unit.
    let ticket = harness
        .service
        .reserve(&product, 1, Some("R1".into()), None, t0())
        .await
        .unwrap();
    assert_eq!(ticket.quantity, 1);

    let availability = harness
        .service
        .check_availability(&product, 1)
        .await
        .unwrap();
    assert_eq!(availability.available, 1);

    let delivered = harness.sink.delivered();
    assert_eq!(delivered.len(), 1, "LOW alert fired on the reserve mutation");
    assert_eq!(delivered[0].severity, Severity::Low);

    // R2 wants two units; only one is unpromised.
    let err = harness
        .service
        .reserve(&product, 2, Some("R2".into()), None, t0())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        InventoryError::InsufficientStock {
            requested: 2,
            available: 1
        }
    );

    // Payment lands; R1 commits.
    let new_total = harness
        .service
        .commit_reservation("R1", "order_1001", t0())
        .await
        .unwrap();
    assert_eq!(new_total, 1);

    let record = harness.store.load_stock(&product).await.unwrap();
    assert_eq!(record.total_quantity, 1);
    assert_eq!(record.reserved_quantity, 0);

    // A stray release of the committed reservation is a harmless no-op.
    assert_eq!(harness.service.release("R1", t0()).await.unwrap(), 0);
    let record = harness.store.load_stock(&product).await.unwrap();
    assert_eq!(record.total_quantity, 1);
    assert_eq!(record.reserved_quantity, 0);

    // Still exactly one open LOW alert: the later breaches deduplicated.
    let open = harness.store.open_alerts(Some(&product)).await.unwrap();
    assert_eq!(open.len(), 1);
}

/// Payment failure path: the reservation is released and the next buyer
/// can claim the stock immediately.
#[tokio::test]
async fn failed_payment_releases_stock_for_next_buyer() {
    let harness = Harness::new();
    let product = harness.seed("p-1", 1, 0, 0).await;

    harness
        .service
        .reserve(&product, 1, Some("R1".into()), None, t0())
        .await
        .unwrap();

    // Second buyer blocked while the hold is live.
    let err = harness
        .service
        .reserve(&product, 1, Some("R2".into()), None, t0())
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::InsufficientStock { .. }));

    // Payment fails; checkout releases.
    assert_eq!(harness.service.release("R1", t0()).await.unwrap(), 1);

    // Second buyer succeeds now.
    harness
        .service
        .reserve(&product, 1, Some("R2".into()), None, t0())
        .await
        .unwrap();
    harness
        .service
        .commit_reservation("R2", "order_1002", t0())
        .await
        .unwrap();

    let record = harness.store.load_stock(&product).await.unwrap();
    assert_eq!(record.total_quantity, 0);
    assert_eq!(record.reserved_quantity, 0);
}
