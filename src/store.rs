//! Transcript and per-contact bot flag persistence.
//!
//! The backend is picked from the connection string scheme: Postgres for
//! `postgres://` / `postgresql://`, an in-process store for `memory://`.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::MessageRecord;

pub enum Store {
    Postgres(PgStore),
    Memory(MemoryStore),
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let scheme = database_url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or("");
        match scheme {
            "postgres" | "postgresql" => Ok(Store::Postgres(PgStore::connect(database_url).await?)),
            "memory" => Ok(Store::Memory(MemoryStore::default())),
            other => Err(StoreError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn memory() -> Self {
        Store::Memory(MemoryStore::default())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Store::Postgres(_) => "postgres",
            Store::Memory(_) => "memory",
        }
    }

    pub async fn append(&self, record: &MessageRecord) -> Result<(), StoreError> {
        match self {
            Store::Postgres(s) => s.append(record).await,
            Store::Memory(s) => {
                s.append(record).await;
                Ok(())
            }
        }
    }

    /// Every record ever appended, oldest first.
    pub async fn list_all(&self) -> Result<Vec<MessageRecord>, StoreError> {
        match self {
            Store::Postgres(s) => s.list_all().await,
            Store::Memory(s) => Ok(s.list_all().await),
        }
    }

    /// Flip the bot flag for `phone` and return the new value. A contact seen
    /// for the first time starts at `true`.
    pub async fn toggle(&self, phone: &str) -> Result<bool, StoreError> {
        match self {
            Store::Postgres(s) => s.toggle(phone).await,
            Store::Memory(s) => Ok(s.toggle(phone).await),
        }
    }

    pub async fn bot_enabled(&self, phone: &str) -> Result<Option<bool>, StoreError> {
        match self {
            Store::Postgres(s) => s.bot_enabled(phone).await,
            Store::Memory(s) => Ok(s.bot_enabled(phone).await),
        }
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn append(&self, record: &MessageRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversations (phone, message, from_user, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&record.phone)
        .bind(&record.message)
        .bind(record.from_user)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = sqlx::query("SELECT phone, message, from_user FROM conversations ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| MessageRecord {
                phone: row.get("phone"),
                message: row.get("message"),
                from_user: row.get("from_user"),
            })
            .collect())
    }

    async fn toggle(&self, phone: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO contact_settings (phone, bot_enabled) VALUES ($1, TRUE)
            ON CONFLICT (phone) DO UPDATE SET bot_enabled = NOT contact_settings.bot_enabled
            RETURNING bot_enabled
            "#,
        )
        .bind(phone)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<bool, _>("bot_enabled"))
    }

    async fn bot_enabled(&self, phone: &str) -> Result<Option<bool>, StoreError> {
        let row = sqlx::query("SELECT bot_enabled FROM contact_settings WHERE phone = $1")
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<bool, _>("bot_enabled")))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    conversations: RwLock<Vec<MessageRecord>>,
    settings: RwLock<HashMap<String, bool>>,
}

impl MemoryStore {
    async fn append(&self, record: &MessageRecord) {
        self.conversations.write().await.push(record.clone());
    }

    async fn list_all(&self) -> Vec<MessageRecord> {
        self.conversations.read().await.clone()
    }

    async fn toggle(&self, phone: &str) -> bool {
        let mut settings = self.settings.write().await;
        let enabled = settings
            .get(phone)
            .map(|current| !current)
            .unwrap_or(true);
        settings.insert(phone.to_string(), enabled);
        enabled
    }

    async fn bot_enabled(&self, phone: &str) -> Option<bool> {
        self.settings.read().await.get(phone).copied()
    }
}
