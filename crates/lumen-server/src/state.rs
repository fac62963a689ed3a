use std::sync::Arc;

use lumen_subscriptions::{
    SubscriptionEngine, TenantInfo, TenantRegistry, UnavailableValueSetService,
};

use crate::config::AppConfig;
use crate::error::ApiError;

/// Shared application state: configuration plus the tenant → engine map.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub tenants: Arc<TenantRegistry>,
}

impl AppState {
    /// Provision engines for every configured tenant.
    pub async fn from_config(config: AppConfig) -> Self {
        let tenants = Arc::new(TenantRegistry::new(
            config.engine.clone(),
            Arc::new(UnavailableValueSetService),
        ));

        for tenant in config.effective_tenants() {
            let info = TenantInfo {
                id: tenant.id.clone(),
                base_url: tenant.base_url.clone(),
                recognized_content_types: tenant.recognized_content_types.clone(),
            };
            tenants.get_or_create(info).await;
        }

        Self {
            config: Arc::new(config),
            tenants,
        }
    }

    /// Engine for a provisioned tenant; unknown tenants are 404s.
    pub fn engine(&self, tenant_id: &str) -> Result<Arc<SubscriptionEngine>, ApiError> {
        self.tenants
            .get(tenant_id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown tenant '{tenant_id}'")))
    }
}
