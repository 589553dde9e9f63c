//! Wires a [`monico_core::App`] from layered configuration: picks the
//! storage backend `resolve_backend` selected, connects it, and returns the
//! facade ready for a subcommand to use.

use anyhow::Result;
use monico_core::config::{BackendChoice, Config, ConfigLoader};
use monico_core::{App, Storage};
use std::sync::Arc;

pub fn load_config() -> Result<Config> {
    Ok(ConfigLoader.load()?)
}

pub async fn build_app(config: &Config) -> Result<App> {
    let storage = build_storage(config)?;
    storage.connect().await?;
    Ok(App::new(storage))
}

fn build_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match config.resolve_backend()? {
        BackendChoice::Postgres(uri) => {
            Ok(Arc::new(monico_storage_postgres::PgStorage::new(&uri)?))
        }
        BackendChoice::Sqlite(uri) => {
            Ok(Arc::new(monico_storage_sqlite::SqliteStorage::new(&uri)?))
        }
    }
}
