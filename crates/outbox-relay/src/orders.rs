//! Order placement: the producer side of the outbox.

use crate::envelope::encode_order;
use crate::error::{RelayError, RelayResult};
use outbox_database::{queries, AsyncDatabase, DatabaseError, PlacedOrder};
use tracing::info;

/// Insert an order and its outbox event in one transaction.
///
/// Either both rows are committed or neither is.
pub async fn place_order(db: &AsyncDatabase, total_amount: f64) -> RelayResult<PlacedOrder> {
    if !total_amount.is_finite() || total_amount < 0.0 {
        return Err(RelayError::Config(format!(
            "total amount must be a non-negative number, got {total_amount}"
        )));
    }

    let placed = db
        .transaction(move |tx| {
            let order = queries::insert_order(tx, total_amount)?;
            let payload = encode_order(&order).map_err(DatabaseError::from)?;
            let outbox_id = queries::write_outbox_row(tx, &order.aggregate_id(), &payload)?;
            Ok(PlacedOrder { order, outbox_id })
        })
        .await?;

    info!(
        order_id = placed.order.id,
        outbox_id = placed.outbox_id,
        total_amount,
        "Order placed"
    );

    Ok(placed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{decode, Decoded};
    use outbox_database::OutboxStatus;

    #[tokio::test]
    async fn test_place_order_writes_both_rows() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();

        let placed = place_order(&db, 42.5).await.unwrap();
        let outbox_id = placed.outbox_id;

        let row = db
            .call(move |conn| queries::get_outbox_row(conn, outbox_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.aggregate_id, format!("order-{}", placed.order.id));
        assert_eq!(row.status, OutboxStatus::Pending);

        match decode(&row.payload, "finished") {
            Decoded::Valid(envelope) => assert_eq!(envelope.correlation_key, placed.order.id),
            Decoded::Invalid(reason) => panic!("payload should decode: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_place_order_rejects_bad_amount() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        assert!(place_order(&db, f64::NAN).await.is_err());
        assert!(place_order(&db, -1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_outbox_failure_rolls_back_order() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        db.call_sqlite(|conn| conn.execute_batch("DROP TABLE outbox"))
            .await
            .unwrap();

        assert!(place_order(&db, 10.0).await.is_err());

        let orders: i64 = db
            .call_sqlite(|conn| conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(orders, 0);
    }
}
