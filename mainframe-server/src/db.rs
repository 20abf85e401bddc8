use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use url::Url;

use crate::config::DatabaseConfig;

/// Opens the connection pool described by `settings`.
pub async fn connect(settings: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(&settings.url)
        .await
        .with_context(|| {
            format!(
                "failed to connect to PostgreSQL at {}",
                redact_database_url(&settings.url)
            )
        })
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    mainframe_core::MIGRATOR
        .run(pool)
        .await
        .context("database migration failed")
}

/// Masks the password so the URL can be logged.
pub fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable database url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_masked() {
        assert_eq!(
            redact_database_url("postgres://scan:hunter2@db:5432/mainframe"),
            "postgres://scan:****@db:5432/mainframe"
        );
        assert_eq!(
            redact_database_url("postgres://db/mainframe"),
            "postgres://db/mainframe"
        );
    }
}
