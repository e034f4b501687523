//! Apply the membership schema to the configured database.

use std::process::ExitCode;

use warden_infra::config::{StoreConfig, WardenConfig};
use warden_infra::{StoreError, db};

#[tokio::main]
async fn main() -> ExitCode {
    warden_observability::init();

    let config = match WardenConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let Some(store) = config.store else {
        tracing::info!("USE_PERSISTENT_STORES is not set; nothing to migrate");
        return ExitCode::SUCCESS;
    };

    match migrate(&store).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "schema migration failed");
            ExitCode::FAILURE
        }
    }
}

async fn migrate(config: &StoreConfig) -> Result<(), StoreError> {
    let pool = db::connect(config).await?;
    let result = db::ensure_schema(&pool).await;
    db::close(&pool).await;
    result
}
