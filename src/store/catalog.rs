use anyhow::{Result, anyhow};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;

use super::TenantResolver;
use crate::config::PosConfig;

/// Catalog item as returned by the POS provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub name: String,
    pub price: Option<f64>,
    pub description: Option<String>,
    pub category: Option<String>,
}

/// Thin client for the POS provider: OAuth code exchange, catalog fetch and
/// order submission. The access token is process-local; durable token
/// storage belongs to the backend.
pub struct PosClient {
    client: Client,
    config: PosConfig,
    access_token: Mutex<Option<String>>,
}

impl PosClient {
    pub fn new(config: &PosConfig) -> Self {
        Self {
            client: Client::new(),
            config: config.clone(),
            access_token: Mutex::new(None),
        }
    }

    pub async fn exchange_code(&self, code: &str) -> Result<()> {
        let token_url = self
            .config
            .token_url
            .as_deref()
            .ok_or_else(|| anyhow!("pos.token_url not configured"))?;
        let res = self
            .client
            .post(token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.config.client_id.as_deref().unwrap_or("")),
                (
                    "client_secret",
                    self.config.client_secret.as_deref().unwrap_or(""),
                ),
            ])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!("token exchange failed: {}", res.status()));
        }
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let token: TokenResponse = res.json().await?;
        *self.access_token.lock().unwrap() = Some(token.access_token);
        info!("POS access token refreshed");
        Ok(())
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.access_token.lock().unwrap().as_ref() {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    pub async fn fetch_items(&self, tenant_id: &str) -> Result<Vec<CatalogItem>> {
        let url = format!(
            "{}/catalog/items?tenant_id={}",
            self.config.base_url.trim_end_matches('/'),
            tenant_id
        );
        let res = self.authorized(self.client.get(&url)).send().await?;
        if !res.status().is_success() {
            return Err(anyhow!("catalog fetch failed: {}", res.status()));
        }
        Ok(res.json().await?)
    }

    pub async fn submit_order(&self, tenant_id: &str, order_id: &str) -> Result<()> {
        let url = format!("{}/orders", self.config.base_url.trim_end_matches('/'));
        let res = self
            .authorized(self.client.post(&url))
            .json(&serde_json::json!({
                "tenantId": tenant_id,
                // The gateway order id doubles as the idempotency key so
                // at-least-once job delivery cannot double-submit.
                "externalId": order_id,
            }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!("order submission failed: {}", res.status()));
        }
        Ok(())
    }

    /// Fetch the tenant's catalog and rewrite its cached menu text.
    pub async fn sync_catalog(
        &self,
        resolver: &dyn TenantResolver,
        tenant_id: &str,
    ) -> Result<usize> {
        let items = self.fetch_items(tenant_id).await?;
        let menu = render_menu(&items);
        resolver.update_menu_cache(tenant_id, menu).await?;
        info!(tenant_id, items = items.len(), "menu cache refreshed");
        Ok(items.len())
    }
}

/// Render catalog items as the plain-text menu the session prompt embeds,
/// grouped by category.
pub fn render_menu(items: &[CatalogItem]) -> String {
    let mut grouped: BTreeMap<&str, Vec<&CatalogItem>> = BTreeMap::new();
    for item in items {
        grouped
            .entry(item.category.as_deref().unwrap_or("Menu"))
            .or_default()
            .push(item);
    }

    let mut out = String::new();
    for (category, items) in grouped {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(category);
        out.push('\n');
        for item in items {
            out.push_str("- ");
            out.push_str(&item.name);
            if let Some(price) = item.price {
                out.push_str(&format!(" ${:.2}", price));
            }
            if let Some(description) = item.description.as_deref().filter(|d| !d.is_empty()) {
                out.push_str(&format!(" ({})", description));
            }
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_items_grouped_by_category() {
        let items = vec![
            CatalogItem {
                name: "Bulgogi".to_string(),
                price: Some(18.0),
                description: Some("marinated beef".to_string()),
                category: Some("Mains".to_string()),
            },
            CatalogItem {
                name: "Barley tea".to_string(),
                price: Some(3.5),
                description: None,
                category: Some("Drinks".to_string()),
            },
            CatalogItem {
                name: "Galbi".to_string(),
                price: None,
                description: None,
                category: Some("Mains".to_string()),
            },
        ];
        let menu = render_menu(&items);
        assert_eq!(
            menu,
            "Drinks\n- Barley tea $3.50\n\nMains\n- Bulgogi $18.00 (marinated beef)\n- Galbi"
        );
    }

    #[test]
    fn uncategorized_items_fall_under_a_default_heading() {
        let items = vec![CatalogItem {
            name: "Special".to_string(),
            price: None,
            description: None,
            category: None,
        }];
        assert_eq!(render_menu(&items), "Menu\n- Special");
    }

    #[test]
    fn empty_catalog_renders_empty_menu() {
        assert_eq!(render_menu(&[]), "");
    }
}
