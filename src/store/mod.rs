use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::config::BackendConfig;

pub mod catalog;

pub use catalog::PosClient;

pub const FALLBACK_PERSONA: &str = "You are a friendly restaurant assistant answering a phone call. \
     Help the caller with menu questions, orders and reservations. Keep replies short; they are spoken aloud.";

/// Immutable tenant snapshot captured when a session opens.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreProfile {
    pub tenant_id: String,
    pub name: Option<String>,
    pub persona_prompt: Option<String>,
    pub hours_text: Option<String>,
    pub location_text: Option<String>,
    pub custom_knowledge: Option<String>,
    pub menu_cache: Option<String>,
    /// None means active: rows created before the flag existed carry no value.
    pub is_active: Option<bool>,
}

impl StoreProfile {
    pub fn active(&self) -> bool {
        self.is_active.unwrap_or(true)
    }

    /// Compose the session system prompt: persona, hours, location, custom
    /// knowledge and the cached menu, blank-line separated, skipping empty
    /// sections. Falls back to a minimal persona when everything is empty.
    pub fn system_prompt(&self) -> String {
        let sections = [
            &self.persona_prompt,
            &self.hours_text,
            &self.location_text,
            &self.custom_knowledge,
            &self.menu_cache,
        ];
        let joined = sections
            .iter()
            .filter_map(|section| {
                section
                    .as_deref()
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        if joined.is_empty() {
            FALLBACK_PERSONA.to_string()
        } else {
            joined
        }
    }
}

fn default_quantity() -> u32 {
    1
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderItem {
    pub name: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub price: Option<f64>,
    pub notes: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewOrder {
    pub items: Vec<OrderItem>,
    pub total: Option<f64>,
    pub customer_name: Option<String>,
    pub phone: Option<String>,
    pub pickup_time: Option<String>,
    pub notes: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewReservation {
    pub customer_name: Option<String>,
    pub phone: Option<String>,
    pub party_size: Option<u32>,
    pub reservation_time: Option<String>,
    pub notes: Option<String>,
}

#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve(&self, tenant_id: &str) -> Result<Option<StoreProfile>>;
    async fn update_menu_cache(&self, tenant_id: &str, menu: String) -> Result<()>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, tenant_id: &str, order: NewOrder) -> Result<String>;
    async fn insert_reservation(
        &self,
        tenant_id: &str,
        reservation: NewReservation,
    ) -> Result<String>;
}

/// Backend-API implementation of both store traits. All requests carry the
/// tenant in the path; failures are returned to the caller, never retried.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsertAck {
    id: String,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
    }
}

#[async_trait]
impl TenantResolver for HttpBackend {
    async fn resolve(&self, tenant_id: &str) -> Result<Option<StoreProfile>> {
        let res = self
            .request(reqwest::Method::GET, &format!("/tenants/{}", tenant_id))
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(anyhow!("tenant lookup failed: {}", res.status()));
        }
        Ok(Some(res.json().await?))
    }

    async fn update_menu_cache(&self, tenant_id: &str, menu: String) -> Result<()> {
        let res = self
            .request(
                reqwest::Method::PUT,
                &format!("/tenants/{}/menu-cache", tenant_id),
            )
            .json(&json!({ "menuCache": menu }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!("menu cache update failed: {}", res.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for HttpBackend {
    async fn insert_order(&self, tenant_id: &str, order: NewOrder) -> Result<String> {
        let res = self
            .request(
                reqwest::Method::POST,
                &format!("/tenants/{}/orders", tenant_id),
            )
            .json(&json!({ "order": order, "createdAt": Utc::now() }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!("order insert failed: {}", res.status()));
        }
        let ack: InsertAck = res.json().await?;
        Ok(ack.id)
    }

    async fn insert_reservation(
        &self,
        tenant_id: &str,
        reservation: NewReservation,
    ) -> Result<String> {
        let res = self
            .request(
                reqwest::Method::POST,
                &format!("/tenants/{}/reservations", tenant_id),
            )
            .json(&json!({ "reservation": reservation, "createdAt": Utc::now() }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!("reservation insert failed: {}", res.status()));
        }
        let ack: InsertAck = res.json().await?;
        Ok(ack.id)
    }
}

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: String,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub order: NewOrder,
}

#[derive(Debug, Clone)]
pub struct ReservationRow {
    pub id: String,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub reservation: NewReservation,
}

/// In-process backend, used when no backend API is configured and as the
/// test double.
#[derive(Default)]
pub struct MemoryBackend {
    profiles: Mutex<HashMap<String, StoreProfile>>,
    orders: Mutex<Vec<OrderRow>>,
    reservations: Mutex<Vec<ReservationRow>>,
}

impl MemoryBackend {
    pub fn with_profile(profile: StoreProfile) -> Self {
        let backend = Self::default();
        backend.insert_profile(profile);
        backend
    }

    pub fn insert_profile(&self, profile: StoreProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.tenant_id.clone(), profile);
    }

    pub fn orders(&self) -> Vec<OrderRow> {
        self.orders.lock().unwrap().clone()
    }

    pub fn reservations(&self) -> Vec<ReservationRow> {
        self.reservations.lock().unwrap().clone()
    }
}

#[async_trait]
impl TenantResolver for MemoryBackend {
    async fn resolve(&self, tenant_id: &str) -> Result<Option<StoreProfile>> {
        Ok(self.profiles.lock().unwrap().get(tenant_id).cloned())
    }

    async fn update_menu_cache(&self, tenant_id: &str, menu: String) -> Result<()> {
        let mut profiles = self.profiles.lock().unwrap();
        let profile = profiles
            .get_mut(tenant_id)
            .ok_or_else(|| anyhow!("unknown tenant: {}", tenant_id))?;
        profile.menu_cache = Some(menu);
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryBackend {
    async fn insert_order(&self, tenant_id: &str, order: NewOrder) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.orders.lock().unwrap().push(OrderRow {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            created_at: Utc::now(),
            order,
        });
        info!(tenant_id, order_id = id, "order stored");
        Ok(id)
    }

    async fn insert_reservation(
        &self,
        tenant_id: &str,
        reservation: NewReservation,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.reservations.lock().unwrap().push(ReservationRow {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            created_at: Utc::now(),
            reservation,
        });
        info!(tenant_id, reservation_id = id, "reservation stored");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_joins_non_empty_sections() {
        let profile = StoreProfile {
            tenant_id: "t-1".to_string(),
            persona_prompt: Some("You are the host at Seoul Garden.".to_string()),
            hours_text: Some("Open 11am to 10pm daily.".to_string()),
            location_text: Some("   ".to_string()),
            menu_cache: Some("Bulgogi $18".to_string()),
            ..Default::default()
        };
        assert_eq!(
            profile.system_prompt(),
            "You are the host at Seoul Garden.\n\nOpen 11am to 10pm daily.\n\nBulgogi $18"
        );
    }

    #[test]
    fn system_prompt_falls_back_when_everything_is_empty() {
        let profile = StoreProfile::default();
        assert_eq!(profile.system_prompt(), FALLBACK_PERSONA);
    }

    #[test]
    fn missing_active_flag_means_active() {
        let profile = StoreProfile::default();
        assert!(profile.active());
        let inactive = StoreProfile {
            is_active: Some(false),
            ..Default::default()
        };
        assert!(!inactive.active());
    }

    #[test]
    fn order_arguments_deserialize_leniently() {
        let order: NewOrder = serde_json::from_value(serde_json::json!({
            "items": [{ "name": "Bulgogi" }],
            "customerName": "Dana",
        }))
        .unwrap();
        assert_eq!(order.items[0].quantity, 1);
        assert_eq!(order.customer_name.as_deref(), Some("Dana"));
        assert!(order.phone.is_none());
    }

    #[tokio::test]
    async fn memory_backend_round_trips_profiles_and_rows() {
        let backend = MemoryBackend::with_profile(StoreProfile {
            tenant_id: "t-9".to_string(),
            ..Default::default()
        });
        assert!(backend.resolve("t-9").await.unwrap().is_some());
        assert!(backend.resolve("nope").await.unwrap().is_none());

        backend
            .update_menu_cache("t-9", "Galbi $24".to_string())
            .await
            .unwrap();
        let profile = backend.resolve("t-9").await.unwrap().unwrap();
        assert_eq!(profile.menu_cache.as_deref(), Some("Galbi $24"));

        let id = backend
            .insert_order("t-9", NewOrder::default())
            .await
            .unwrap();
        assert_eq!(backend.orders().len(), 1);
        assert_eq!(backend.orders()[0].id, id);
    }
}
