//! Message bodies for customer emails and admin alerts.

use std::fmt::Write as _;

use super::EmailMessage;
use crate::inventory::LowStockItem;
use crate::models::{Order, OrderItem};

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn wrap(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><body style=\"font-family:Arial,sans-serif;color:#222\">\
         <h2>{}</h2>{body}<p style=\"color:#888;font-size:12px\">Thank you for ordering with us.</p>\
         </body></html>",
        escape(title)
    )
}

fn items_table(items: &[OrderItem]) -> String {
    let mut rows = String::new();
    for item in items {
        let name = item
            .product_name
            .clone()
            .unwrap_or_else(|| format!("Product #{}", item.product_id));
        let _ = write!(
            rows,
            "<tr><td>{}</td><td>{}</td><td>&pound;{:.2}</td></tr>",
            escape(&name),
            item.quantity,
            item.price * item.quantity as f64
        );
    }
    format!("<table cellpadding=\"4\"><tr><th>Item</th><th>Qty</th><th>Total</th></tr>{rows}</table>")
}

pub fn order_confirmation(order: &Order, items: &[OrderItem]) -> EmailMessage {
    let mut body = format!(
        "<p>Hi {},</p><p>We've received your order <strong>#{}</strong>.</p>",
        escape(&order.customer_name),
        order.id
    );
    body.push_str(&items_table(items));
    if order.discount_amount > 0.0 {
        let _ = write!(
            body,
            "<p>Discount ({}): -&pound;{:.2}</p>",
            escape(order.discount_code.as_deref().unwrap_or("")),
            order.discount_amount
        );
    }
    let _ = write!(
        body,
        "<p><strong>Total: &pound;{:.2}</strong></p>",
        order.total_amount
    );
    if order.is_collection() {
        let _ = write!(
            body,
            "<p>Collect from our {} shop.</p>",
            escape(order.location.as_str())
        );
    } else {
        let _ = write!(body, "<p>Delivering to: {}</p>", escape(&order.address));
    }

    EmailMessage {
        to: order.customer_email.clone(),
        subject: format!("Order confirmation #{}", order.id),
        body_html: wrap("Order confirmed", &body),
    }
}

pub fn feedback_request(order: &Order, frontend_url: &str) -> EmailMessage {
    let link = format!("{frontend_url}/feedback?order={}", order.id);
    let body = format!(
        "<p>Hi {},</p><p>Your order #{} has been delivered. How did we do?</p>\
         <p><a href=\"{}\">Leave feedback</a> and get 10% off your next order.</p>",
        escape(&order.customer_name),
        order.id,
        escape(&link)
    );
    EmailMessage {
        to: order.customer_email.clone(),
        subject: format!("How was order #{}?", order.id),
        body_html: wrap("Your order was delivered", &body),
    }
}

pub fn order_cancelled(order: &Order, refunded: bool) -> EmailMessage {
    let refund_line = if refunded {
        format!(
            "<p>A full refund of &pound;{:.2} has been issued to your original payment method.</p>",
            order.total_amount
        )
    } else {
        String::new()
    };
    let body = format!(
        "<p>Hi {},</p><p>Your order #{} has been cancelled.</p>{refund_line}",
        escape(&order.customer_name),
        order.id
    );
    EmailMessage {
        to: order.customer_email.clone(),
        subject: format!("Order #{} cancelled", order.id),
        body_html: wrap("Order cancelled", &body),
    }
}

pub fn feedback_coupon(email: &str, code: &str, expires_at: &str) -> EmailMessage {
    let expires = expires_at.get(..10).unwrap_or(expires_at);
    let body = format!(
        "<p>Thanks for your feedback!</p><p>Here is 10% off your next order:</p>\
         <p style=\"font-size:20px\"><strong>{}</strong></p><p>Valid until {}.</p>",
        escape(code),
        escape(expires)
    );
    EmailMessage {
        to: email.to_string(),
        subject: "Your 10% discount code".to_string(),
        body_html: wrap("Thank you", &body),
    }
}

pub fn booking_confirmation(
    email: &str,
    name: &str,
    event_title: &str,
    adults: i64,
    children: i64,
    booking_id: i64,
) -> EmailMessage {
    let body = format!(
        "<p>Hi {},</p><p>Your booking #{booking_id} for <strong>{}</strong> is confirmed: \
         {adults} adult(s), {children} child(ren).</p>\
         <p>As a ticket holder you'll receive a monthly discount code for our shops.</p>",
        escape(name),
        escape(event_title)
    );
    EmailMessage {
        to: email.to_string(),
        subject: format!("Booking confirmed: {event_title}"),
        body_html: wrap("Booking confirmed", &body),
    }
}

pub fn event_discount(email: &str, code: &str, month: &str, expires_at: &str) -> EmailMessage {
    let expires = expires_at.get(..10).unwrap_or(expires_at);
    let body = format!(
        "<p>Your ticket-holder discount for {} is ready:</p>\
         <p style=\"font-size:20px\"><strong>{}</strong></p>\
         <p>10% off one order (up to &pound;40), valid until {}.</p>",
        escape(month),
        escape(code),
        escape(expires)
    );
    EmailMessage {
        to: email.to_string(),
        subject: format!("Your discount code for {month}"),
        body_html: wrap("Monthly discount", &body),
    }
}

// ---------------------------------------------------------------------------
// Admin WhatsApp text
// ---------------------------------------------------------------------------

pub fn new_order_alert(order: &Order, items: &[OrderItem]) -> String {
    let mut text = format!(
        "New order #{} ({})\n{} - {}\n",
        order.id,
        order.location,
        order.customer_name,
        order.customer_phone.as_deref().unwrap_or("no phone")
    );
    for item in items {
        let name = item
            .product_name
            .clone()
            .unwrap_or_else(|| format!("#{}", item.product_id));
        let _ = writeln!(text, "{} x {}", item.quantity, name);
    }
    let _ = write!(
        text,
        "Total: £{:.2}\n{}",
        order.total_amount,
        if order.is_collection() {
            "Collection".to_string()
        } else {
            format!("Deliver to: {}", order.address)
        }
    );
    text
}

pub fn low_stock_alert(items: &[LowStockItem]) -> String {
    let mut text = String::from("Low stock alert:");
    for item in items {
        let _ = write!(
            text,
            "\n{} at {}: {} left",
            item.name, item.location, item.inventory
        );
    }
    text
}

pub fn overbooked_alert(booking_id: i64, event_title: &str, email: &str) -> String {
    format!(
        "Overbooked: booking #{booking_id} for \"{event_title}\" ({email}) was paid after capacity ran out. Please contact the customer."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Location;

    #[test]
    fn escape_handles_markup() {
        assert_eq!(escape("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#39;");
    }

    #[test]
    fn low_stock_alert_lists_each_item() {
        let text = low_stock_alert(&[
            LowStockItem {
                product_id: 1,
                name: "Pie".into(),
                location: Location::Leeds,
                inventory: 3,
            },
            LowStockItem {
                product_id: 2,
                name: "Tea".into(),
                location: Location::Leeds,
                inventory: 0,
            },
        ]);
        assert_eq!(text, "Low stock alert:\nPie at leeds: 3 left\nTea at leeds: 0 left");
    }

    #[test]
    fn coupon_email_shows_date_only() {
        let msg = feedback_coupon("a@b.c", "THANKS-1234ABCD", "2027-04-19T10:00:00+00:00");
        assert!(msg.body_html.contains("THANKS-1234ABCD"));
        assert!(msg.body_html.contains("Valid until 2027-04-19."));
    }
}
