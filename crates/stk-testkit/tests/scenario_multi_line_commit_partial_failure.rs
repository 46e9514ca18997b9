use stk_inventory::CommitLine;
use stk_schemas::{InventoryError, ProductId};
use stk_store::StockStore;
use stk_testkit::{t0, Harness};

/// A three-line order where the middle line cannot ship: the other lines
/// commit and stay committed, and the caller gets the per-line breakdown.
#[tokio::test]
async fn one_failed_line_does_not_roll_back_the_others() {
    let harness = Harness::new();
    let shirts = harness.seed("shirts", 10, 0, 0).await;
    let mugs = harness.seed("mugs", 1, 0, 0).await;

    harness
        .service
        .reserve(&shirts, 2, Some("r-shirts".into()), None, t0())
        .await
        .unwrap();
    // Someone else holds the only mug.
    harness
        .service
        .reserve(&mugs, 1, Some("r-other".into()), None, t0())
        .await
        .unwrap();

    let report = harness
        .service
        .commit_lines(
            vec![
                CommitLine::Reservation {
                    reservation_id: "r-shirts".into(),
                },
                CommitLine::Direct {
                    product_id: mugs.clone(),
                    quantity: 1,
                },
                CommitLine::Direct {
                    product_id: shirts.clone(),
                    quantity: 3,
                },
            ],
            "order_2002",
            t0(),
        )
        .await;

    assert_eq!(report.committed, 2);
    assert_eq!(report.failed, 1);
    assert!(!report.is_fully_committed());

    assert!(report.outcomes[0].result.is_ok());
    assert_eq!(
        report.outcomes[1].result,
        Err(InventoryError::InsufficientStock {
            requested: 1,
            available: 0
        })
    );
    assert!(report.outcomes[2].result.is_ok());

    // Shirts shipped (2 reserved + 3 direct); mugs untouched.
    let shirts_record = harness.store.load_stock(&shirts).await.unwrap();
    assert_eq!(shirts_record.total_quantity, 5);
    let mugs_record = harness.store.load_stock(&mugs).await.unwrap();
    assert_eq!(mugs_record.total_quantity, 1);
    assert_eq!(mugs_record.reserved_quantity, 1);
}

/// Per-line errors keep their kinds: unknown products report NotFound while
/// settled reservations report InvalidState.
#[tokio::test]
async fn line_errors_keep_their_kinds() {
    let harness = Harness::new();
    let product = harness.seed("p-1", 5, 0, 0).await;
    harness
        .service
        .reserve(&product, 1, Some("r-1".into()), None, t0())
        .await
        .unwrap();
    harness.service.release("r-1", t0()).await.unwrap();

    let report = harness
        .service
        .commit_lines(
            vec![
                CommitLine::Reservation {
                    reservation_id: "r-1".into(),
                },
                CommitLine::Direct {
                    product_id: ProductId::new("ghost"),
                    quantity: 1,
                },
            ],
            "order_3003",
            t0(),
        )
        .await;

    assert_eq!(report.failed, 2);
    assert!(matches!(
        report.outcomes[0].result,
        Err(InventoryError::InvalidState { .. })
    ));
    assert!(matches!(
        report.outcomes[1].result,
        Err(InventoryError::NotFound { .. })
    ));
}
