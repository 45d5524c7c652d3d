//! Order status transitions.
//!
//! `pending → confirmed → preparing → ready → delivered`, with `cancelled`
//! reachable from any non-terminal state. Delivered and cancelled orders
//! accept no further transitions.

use rusqlite::params;
use tracing::{error, info};

use super::{get_order, order_items};
use crate::auth::Claims;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::inventory;
use crate::models::{Order, OrderStatus, PaymentMethod, PaymentStatus, Role};
use crate::notify::templates;
use crate::state::AppState;

/// Check the caller may move `order` to `next`.
fn authorize(order: &Order, next: OrderStatus, actor: &Claims) -> AppResult<()> {
    match actor.role {
        Role::Driver => {
            if order.driver_id != Some(actor.sub) {
                return Err(AppError::forbidden("This order is not on your route"));
            }
            if next != OrderStatus::Delivered {
                return Err(AppError::forbidden("Drivers can only mark orders delivered"));
            }
        }
        Role::Admin | Role::SuperAdmin => {
            if let Some(bound) = actor.location {
                if bound != order.location {
                    return Err(AppError::forbidden(format!(
                        "Order #{} belongs to the {} shop",
                        order.id, order.location
                    )));
                }
            }
        }
        Role::Organiser => {
            return Err(AppError::forbidden("Insufficient permissions"));
        }
    }
    Ok(())
}

pub async fn update_status(
    state: &AppState,
    order_id: i64,
    next: OrderStatus,
    actor: &Claims,
) -> AppResult<Order> {
    let order = {
        let conn = state.db.lock()?;
        get_order(&conn, order_id)?
    };
    authorize(&order, next, actor)?;

    if order.status.is_terminal() {
        return Err(AppError::bad_request(format!(
            "Order #{order_id} is already {}",
            order.status
        )));
    }
    if order.status == next {
        return Err(AppError::bad_request(format!(
            "Order #{order_id} is already {next}"
        )));
    }

    if next == OrderStatus::Cancelled {
        return cancel(state, order).await;
    }

    let updated = {
        let conn = state.db.lock()?;
        let changed = conn.execute(
            "UPDATE orders SET status = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND status = ?3",
            params![next, order_id, order.status],
        )?;
        if changed == 0 {
            return Err(AppError::conflict(format!(
                "Order #{order_id} was updated by someone else, reload and try again"
            )));
        }
        get_order(&conn, order_id)?
    };

    info!(order_id, from = %order.status, to = %next, by = actor.sub, "order status updated");

    if next == OrderStatus::Delivered {
        state
            .notifier
            .email(templates::feedback_request(
                &updated,
                &state.config.frontend_url,
            ))
            .await;
    }

    Ok(updated)
}

/// Refund (for paid online orders), then restock and mark cancelled in one
/// transaction. A failed refund leaves the order untouched.
async fn cancel(state: &AppState, order: Order) -> AppResult<Order> {
    let needs_refund = order.payment_method == PaymentMethod::Online
        && order.payment_status == PaymentStatus::Paid
        && order.stripe_session_id.is_some();

    if needs_refund {
        let session_id = order.stripe_session_id.as_deref().unwrap_or_default();
        state
            .payments
            .refund(session_id, order.payment_intent_id.as_deref())
            .await
            .map_err(|e| {
                error!(order_id = order.id, error = %e, "refund failed, cancellation aborted");
                AppError::Payment(format!("Refund failed: {}", e.public_message()))
            })?;
    }

    let cancelled = {
        let conn = state.db.lock()?;
        db::immediate(&conn, |conn| {
            let changed = conn.execute(
                "UPDATE orders SET status = 'cancelled',
                        payment_status = CASE WHEN ?1 THEN 'refunded' ELSE payment_status END,
                        updated_at = datetime('now')
                 WHERE id = ?2 AND status NOT IN ('delivered', 'cancelled')",
                params![needs_refund, order.id],
            )?;
            if changed == 0 {
                return Err(AppError::conflict(format!(
                    "Order #{} was completed or cancelled concurrently",
                    order.id
                )));
            }
            for item in order_items(conn, order.id)? {
                inventory::increment(conn, item.product_id, order.location, item.quantity)?;
            }
            get_order(conn, order.id)
        })
    };

    let cancelled = match cancelled {
        Ok(order) => order,
        Err(e) => {
            if needs_refund {
                error!(order_id = order.id, error = %e, "order refunded but cancellation failed");
            }
            return Err(e);
        }
    };

    info!(
        order_id = cancelled.id,
        refunded = needs_refund,
        "order cancelled and restocked"
    );

    state
        .notifier
        .email(templates::order_cancelled(&cancelled, needs_refund))
        .await;

    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::stock_at;
    use crate::models::Location;
    use crate::test_support::{seed_online_order, seed_order, seed_products, staff_claims, TestApp};

    fn admin() -> Claims {
        staff_claims(1, Role::Admin, None)
    }

    #[tokio::test]
    async fn cancel_restocks_each_line() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let id = seed_online_order(&app.state.db, Location::Leeds, &[(1, 3), (2, 2)]);
        let (pie_before, brownie_before) = {
            let conn = app.state.db.conn.lock().unwrap();
            (
                stock_at(&conn, 1, Location::Leeds).unwrap(),
                stock_at(&conn, 2, Location::Leeds).unwrap(),
            )
        };

        let order = update_status(&app.state, id, OrderStatus::Cancelled, &admin())
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.payment_status, PaymentStatus::Refunded);
        assert_eq!(app.gateway.refunds(), vec![format!("cs_seed_{id}")]);

        let conn = app.state.db.conn.lock().unwrap();
        assert_eq!(stock_at(&conn, 1, Location::Leeds).unwrap(), pie_before + 3);
        assert_eq!(stock_at(&conn, 2, Location::Leeds).unwrap(), brownie_before + 2);
        drop(conn);

        let sent = app.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("cancelled"));
    }

    #[tokio::test]
    async fn failed_refund_aborts_cancellation() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let id = seed_online_order(&app.state.db, Location::Leeds, &[(1, 3)]);
        app.gateway.fail_next_refund("charge already refunded");

        let err = update_status(&app.state, id, OrderStatus::Cancelled, &admin())
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);

        let conn = app.state.db.conn.lock().unwrap();
        let order = get_order(&conn, id).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(stock_at(&conn, 1, Location::Leeds).unwrap(), 20);
    }

    #[tokio::test]
    async fn cash_orders_cancel_without_refund() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let id = seed_order(&app.state.db, Location::Leeds, OrderStatus::Confirmed);
        let order = update_status(&app.state, id, OrderStatus::Cancelled, &admin())
            .await
            .unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert!(app.gateway.refunds().is_empty());
    }

    #[tokio::test]
    async fn delivered_sends_feedback_request_once() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let id = seed_order(&app.state.db, Location::Leeds, OrderStatus::Ready);

        update_status(&app.state, id, OrderStatus::Delivered, &admin())
            .await
            .unwrap();
        let err = update_status(&app.state, id, OrderStatus::Delivered, &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let sent = app.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body_html.contains(&format!("/feedback?order={id}")));
    }

    #[tokio::test]
    async fn terminal_orders_reject_changes() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let id = seed_order(&app.state.db, Location::Leeds, OrderStatus::Cancelled);
        let err = update_status(&app.state, id, OrderStatus::Preparing, &admin())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), format!("Order #{id} is already cancelled"));
    }

    #[tokio::test]
    async fn drivers_only_deliver_their_own_orders() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let id = seed_order(&app.state.db, Location::Leeds, OrderStatus::Ready);
        app.state
            .db
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE orders SET driver_id = 5 WHERE id = ?1", params![id])
            .unwrap();

        let other = staff_claims(6, Role::Driver, None);
        assert!(matches!(
            update_status(&app.state, id, OrderStatus::Delivered, &other).await,
            Err(AppError::Forbidden(_))
        ));
        let own = staff_claims(5, Role::Driver, None);
        assert!(matches!(
            update_status(&app.state, id, OrderStatus::Cancelled, &own).await,
            Err(AppError::Forbidden(_))
        ));
        let order = update_status(&app.state, id, OrderStatus::Delivered, &own)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
    }

    #[tokio::test]
    async fn location_bound_admin_cannot_touch_other_shops() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let id = seed_order(&app.state.db, Location::Derby, OrderStatus::Pending);
        let leeds_admin = staff_claims(2, Role::Admin, Some(Location::Leeds));
        assert!(matches!(
            update_status(&app.state, id, OrderStatus::Confirmed, &leeds_admin).await,
            Err(AppError::Forbidden(_))
        ));
    }
}
