//! Order-processing workflow.
//!
//! `OrderProcessingOrchestrator` updates inventory, processes payment and
//! confirms the order, then hands notification fan-out to the
//! `NotificationOrchestrator` sub-orchestration. Each step runs only after the
//! previous one succeeded; the first failure fails the order.

use crate::runtime::{ActivityRegistry, OrchestrationRegistry};
use crate::{ActivityContext, OrchestrationContext, OrchestrationError};

pub const ORDER_PROCESSING: &str = "OrderProcessingOrchestrator";
pub const NOTIFICATION: &str = "NotificationOrchestrator";

pub const UPDATE_INVENTORY: &str = "UpdateInventory";
pub const PROCESS_PAYMENT: &str = "ProcessPayment";
pub const CONFIRM_ORDER: &str = "ConfirmOrder";
pub const SEND_ORDER_PLACED: &str = "SendOrderPlacedNotification";
pub const SEND_INVENTORY_UPDATED: &str = "SendInventoryUpdatedNotification";
pub const SEND_PAYMENT_PROCESSED: &str = "SendPaymentProcessedNotification";
pub const SEND_ORDER_CONFIRMED: &str = "SendOrderConfirmedNotification";

/// Notification activities in the order they are sent.
pub const NOTIFICATIONS: [&str; 4] = [
    SEND_ORDER_PLACED,
    SEND_INVENTORY_UPDATED,
    SEND_PAYMENT_PROCESSED,
    SEND_ORDER_CONFIRMED,
];

/// Knobs for the sample activities.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleOptions {
    /// Make `ProcessPayment` reject every order.
    pub fail_payment: bool,
}

pub async fn order_processing(ctx: OrchestrationContext, order_id: String) -> Result<String, OrchestrationError> {
    ctx.trace_info("Order processing workflow is running...");

    ctx.call_activity(UPDATE_INVENTORY, order_id.clone()).await?;
    if let Err(e) = ctx.call_activity(PROCESS_PAYMENT, order_id.clone()).await {
        crate::durable_warn!(ctx, order_id = %order_id, error = %e, "payment failed; order not confirmed");
        return Err(e);
    }
    ctx.call_activity(CONFIRM_ORDER, order_id.clone()).await?;
    ctx.call_sub_orchestration(NOTIFICATION, order_id.clone()).await?;

    ctx.trace_info("Order processing workflow completed.");
    Ok(format!("Order {order_id} processed successfully."))
}

pub async fn notification(ctx: OrchestrationContext, order_id: String) -> Result<String, OrchestrationError> {
    ctx.trace_info("Starting notification orchestration...");
    for name in NOTIFICATIONS {
        crate::durable_debug!(ctx, notification = name, "sending notification");
        if let Err(e) = ctx.call_activity(name, order_id.clone()).await {
            crate::durable_error!(ctx, notification = name, error = %e, "notification failed");
            return Err(e);
        }
    }
    ctx.trace_info("Notification workflow completed.");
    Ok(String::new())
}

pub fn orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register(ORDER_PROCESSING, order_processing)
        .register(NOTIFICATION, notification)
        .build()
}

pub fn activities(options: SampleOptions) -> ActivityRegistry {
    let fail_payment = options.fail_payment;
    ActivityRegistry::builder()
        .register(UPDATE_INVENTORY, |ctx: ActivityContext, order_id: String| async move {
            ctx.trace_info(format!("Updating inventory for order {order_id}"));
            Ok(format!("Inventory updated for {order_id}."))
        })
        .register(PROCESS_PAYMENT, move |ctx: ActivityContext, order_id: String| async move {
            ctx.trace_info(format!("Processing payment for order {order_id}"));
            if fail_payment {
                return Err(format!("payment declined for order {order_id}"));
            }
            Ok(format!("Payment processed for order {order_id}."))
        })
        .register(CONFIRM_ORDER, |ctx: ActivityContext, order_id: String| async move {
            ctx.trace_info(format!("Confirm order {order_id}"));
            Ok(format!("Order {order_id} confirmed."))
        })
        .register(SEND_ORDER_PLACED, |ctx: ActivityContext, order_id: String| async move {
            ctx.trace_info(format!("Sending order placed notification for order {order_id}."));
            Ok(format!("Order placed notification sent for order {order_id}."))
        })
        .register(SEND_INVENTORY_UPDATED, |ctx: ActivityContext, order_id: String| async move {
            ctx.trace_info(format!("Sending inventory updated notification for order {order_id}."));
            Ok(format!("Inventory updated notification sent for order {order_id}."))
        })
        .register(SEND_PAYMENT_PROCESSED, |ctx: ActivityContext, order_id: String| async move {
            ctx.trace_info(format!("Sending payment processed notification for order {order_id}."));
            Ok(format!("Payment processed notification sent for order {order_id}."))
        })
        .register(SEND_ORDER_CONFIRMED, |ctx: ActivityContext, order_id: String| async move {
            ctx.trace_info(format!("Sending order confirmed notification for order {order_id}."));
            Ok(format!("Order confirmed notification sent for order {order_id}."))
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, run_turn};

    fn started(order_id: &str) -> Event {
        Event::OrchestrationStarted {
            event_id: 1,
            name: ORDER_PROCESSING.into(),
            version: "1.0.0".into(),
            input: order_id.into(),
            parent_instance: None,
            parent_id: None,
        }
    }

    #[test]
    fn first_turn_only_schedules_inventory() {
        let out = run_turn(vec![started("order-7")], |ctx| order_processing(ctx, "order-7".into()));
        assert!(out.output.is_none());
        assert_eq!(out.actions.len(), 1);
        assert!(matches!(&out.history[1], Event::ActivityScheduled { name, .. } if name == UPDATE_INVENTORY));
    }

    #[test]
    fn payment_failure_stops_before_confirmation() {
        let history = vec![
            started("order-7"),
            Event::ActivityScheduled {
                event_id: 2,
                name: UPDATE_INVENTORY.into(),
                input: "order-7".into(),
            },
            Event::ActivityCompleted {
                event_id: 3,
                source_event_id: 2,
                result: "ok".into(),
            },
            Event::ActivityScheduled {
                event_id: 4,
                name: PROCESS_PAYMENT.into(),
                input: "order-7".into(),
            },
            Event::ActivityFailed {
                event_id: 5,
                source_event_id: 4,
                error: OrchestrationError::ActivityExecution {
                    name: PROCESS_PAYMENT.into(),
                    cause: "declined".into(),
                },
            },
        ];
        let out = run_turn(history, |ctx| order_processing(ctx, "order-7".into()));
        assert!(out.actions.is_empty());
        match out.output {
            Some(Err(OrchestrationError::ActivityExecution { name, .. })) => assert_eq!(name, PROCESS_PAYMENT),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn registries_cover_every_step() {
        let acts = activities(SampleOptions::default());
        for name in [UPDATE_INVENTORY, PROCESS_PAYMENT, CONFIRM_ORDER].into_iter().chain(NOTIFICATIONS) {
            assert!(acts.has(name), "missing {name}");
        }
        let orchs = orchestrations();
        assert!(orchs.has(ORDER_PROCESSING));
        assert!(orchs.has(NOTIFICATION));
    }
}
