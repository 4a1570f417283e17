use once_cell::sync::Lazy;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::{NewOrder, NewReservation, OrderStore, StoreProfile};

pub const PLACE_ORDER_FAILED: &str = "We were unable to place your order right now.";
pub const MAKE_RESERVATION_FAILED: &str = "We were unable to book your reservation right now.";

/// Tool declarations advertised to the model. Must stay in sync with
/// [`ToolDispatcher::dispatch`].
static FUNCTION_DECLARATIONS: Lazy<Value> = Lazy::new(|| {
    json!([
        {
            "name": "get_menu",
            "description": "Return the restaurant's current menu.",
            "parameters": { "type": "object", "properties": {} }
        },
        {
            "name": "place_order",
            "description": "Place a pickup order once the caller has confirmed items and contact details.",
            "parameters": {
                "type": "object",
                "properties": {
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "quantity": { "type": "integer" },
                                "price": { "type": "number" },
                                "notes": { "type": "string" }
                            },
                            "required": ["name"]
                        }
                    },
                    "total": { "type": "number" },
                    "customerName": { "type": "string" },
                    "phone": { "type": "string" },
                    "pickupTime": { "type": "string" },
                    "notes": { "type": "string" }
                },
                "required": ["items"]
            }
        },
        {
            "name": "make_reservation",
            "description": "Book a table once the caller has confirmed time, party size and contact details.",
            "parameters": {
                "type": "object",
                "properties": {
                    "customerName": { "type": "string" },
                    "phone": { "type": "string" },
                    "partySize": { "type": "integer" },
                    "reservationTime": { "type": "string" },
                    "notes": { "type": "string" }
                },
                "required": ["reservationTime"]
            }
        },
        {
            "name": "check_order_status",
            "description": "Look up the status of an existing order.",
            "parameters": { "type": "object", "properties": { "orderId": { "type": "string" } } }
        },
        {
            "name": "cancel_or_modify",
            "description": "Cancel or change an existing order.",
            "parameters": { "type": "object", "properties": { "orderId": { "type": "string" } } }
        },
        {
            "name": "transfer_to_human",
            "description": "Hand the call over to a staff member.",
            "parameters": { "type": "object", "properties": { "reason": { "type": "string" } } }
        }
    ])
});

pub fn function_declarations() -> Value {
    FUNCTION_DECLARATIONS.clone()
}

/// Executes tool invocations emitted by the model.
///
/// `dispatch` never fails: persistence errors, malformed arguments and
/// unknown tool names all come back as structured payloads with a message
/// the model can voice to the caller.
pub struct ToolDispatcher {
    tenant_id: String,
    call_id: String,
    profile: Arc<StoreProfile>,
    store: Arc<dyn OrderStore>,
}

impl ToolDispatcher {
    pub fn new(
        tenant_id: impl Into<String>,
        call_id: impl Into<String>,
        profile: Arc<StoreProfile>,
        store: Arc<dyn OrderStore>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            call_id: call_id.into(),
            profile,
            store,
        }
    }

    pub async fn dispatch(&self, name: &str, args: &Value) -> Value {
        info!(
            tenant_id = self.tenant_id,
            call_id = self.call_id,
            tool = name,
            "dispatching tool call"
        );
        match name {
            "get_menu" => self.get_menu(),
            "place_order" => self.place_order(args).await,
            "make_reservation" => self.make_reservation(args).await,
            "check_order_status" => json!({
                "status": "under_construction",
                "message": "Order status lookup is not available yet.",
            }),
            "cancel_or_modify" => json!({
                "status": "under_construction",
                "message": "Changing an existing order is not available yet.",
            }),
            "transfer_to_human" => json!({
                "status": "transferring",
                "message": "Transferring you to a team member now.",
            }),
            _ => {
                warn!(call_id = self.call_id, tool = name, "unknown tool requested");
                json!({ "error": "unknown tool" })
            }
        }
    }

    fn get_menu(&self) -> Value {
        match self.profile.menu_cache.as_deref().map(str::trim) {
            Some(menu) if !menu.is_empty() => json!({ "menu": menu }),
            _ => json!({ "menu": "unavailable" }),
        }
    }

    async fn place_order(&self, args: &Value) -> Value {
        let order: NewOrder = match serde_json::from_value(args.clone()) {
            Ok(order) => order,
            Err(e) => {
                warn!(call_id = self.call_id, "malformed order arguments: {}", e);
                return json!({ "success": false, "error": PLACE_ORDER_FAILED });
            }
        };
        match self.store.insert_order(&self.tenant_id, order).await {
            Ok(order_id) => json!({
                "success": true,
                "order_id": order_id,
                "message": "The order has been placed.",
            }),
            Err(e) => {
                warn!(call_id = self.call_id, "order insert failed: {:#}", e);
                json!({ "success": false, "error": PLACE_ORDER_FAILED })
            }
        }
    }

    async fn make_reservation(&self, args: &Value) -> Value {
        let reservation: NewReservation = match serde_json::from_value(args.clone()) {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!(
                    call_id = self.call_id,
                    "malformed reservation arguments: {}", e
                );
                return json!({ "success": false, "error": MAKE_RESERVATION_FAILED });
            }
        };
        match self
            .store
            .insert_reservation(&self.tenant_id, reservation)
            .await
        {
            Ok(reservation_id) => json!({
                "success": true,
                "reservation_id": reservation_id,
                "message": "The reservation is booked.",
            }),
            Err(e) => {
                warn!(call_id = self.call_id, "reservation insert failed: {:#}", e);
                json!({ "success": false, "error": MAKE_RESERVATION_FAILED })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;

    struct FailingStore;

    #[async_trait]
    impl OrderStore for FailingStore {
        async fn insert_order(&self, _tenant_id: &str, _order: NewOrder) -> Result<String> {
            Err(anyhow!("connection refused"))
        }

        async fn insert_reservation(
            &self,
            _tenant_id: &str,
            _reservation: NewReservation,
        ) -> Result<String> {
            Err(anyhow!("connection refused"))
        }
    }

    fn dispatcher_with(store: Arc<dyn OrderStore>, menu: Option<&str>) -> ToolDispatcher {
        let profile = Arc::new(StoreProfile {
            tenant_id: "t-1".to_string(),
            menu_cache: menu.map(str::to_string),
            ..Default::default()
        });
        ToolDispatcher::new("t-1", "call-1", profile, store)
    }

    #[tokio::test]
    async fn get_menu_returns_cache_without_io() {
        let dispatcher = dispatcher_with(Arc::new(FailingStore), Some("Bulgogi $18"));
        let payload = dispatcher.dispatch("get_menu", &json!({})).await;
        assert_eq!(payload, json!({ "menu": "Bulgogi $18" }));
    }

    #[tokio::test]
    async fn get_menu_without_cache_is_unavailable() {
        let dispatcher = dispatcher_with(Arc::new(FailingStore), None);
        let payload = dispatcher.dispatch("get_menu", &json!({})).await;
        assert_eq!(payload, json!({ "menu": "unavailable" }));
    }

    #[tokio::test]
    async fn place_order_inserts_and_reports_the_id() {
        let store = Arc::new(MemoryBackend::default());
        let dispatcher = dispatcher_with(store.clone(), None);
        let payload = dispatcher
            .dispatch(
                "place_order",
                &json!({ "items": [{ "name": "Bulgogi", "quantity": 2 }], "customerName": "Dana" }),
            )
            .await;
        assert_eq!(payload["success"], json!(true));
        let orders = store.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(payload["order_id"].as_str().unwrap(), orders[0].id);
        assert_eq!(orders[0].order.items[0].quantity, 2);
    }

    #[tokio::test]
    async fn store_failures_become_voice_safe_payloads() {
        let dispatcher = dispatcher_with(Arc::new(FailingStore), None);
        let payload = dispatcher
            .dispatch("place_order", &json!({ "items": [] }))
            .await;
        assert_eq!(
            payload,
            json!({ "success": false, "error": PLACE_ORDER_FAILED })
        );

        let payload = dispatcher.dispatch("make_reservation", &json!({})).await;
        assert_eq!(
            payload,
            json!({ "success": false, "error": MAKE_RESERVATION_FAILED })
        );
    }

    #[tokio::test]
    async fn deferred_and_unknown_tools_still_answer() {
        let dispatcher = dispatcher_with(Arc::new(FailingStore), None);
        let payload = dispatcher.dispatch("check_order_status", &json!({})).await;
        assert_eq!(payload["status"], json!("under_construction"));

        let payload = dispatcher.dispatch("transfer_to_human", &json!({})).await;
        assert_eq!(payload["status"], json!("transferring"));

        let payload = dispatcher.dispatch("warp_drive", &json!({})).await;
        assert_eq!(payload, json!({ "error": "unknown tool" }));
    }
}
