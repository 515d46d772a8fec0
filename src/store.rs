// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Storage
//!
//! The durable side of the relay. The router only needs two operations from
//! it (create a message, mark a message read); the rest exists for seeding,
//! monitoring and tests. Supports in-memory (for testing) and SQLite (for
//! production) backends.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Public profile fields of a user, echoed as the sender summary of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: Option<String>,
    pub email: String,
    pub image: Option<String>,
}

/// A message as recorded by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub sender: UserProfile,
}

/// Trait for message storage backends.
pub trait MessageStore: Send + Sync {
    /// Inserts or replaces a user profile.
    fn upsert_user(&self, user: &UserProfile) -> Result<(), StoreError>;

    /// Returns the profile for `user_id`, inserting a minimal one if the user
    /// has never been seen.
    fn ensure_user(&self, user_id: &str) -> Result<UserProfile, StoreError>;

    /// Records a new unread message. Participants without a profile get a
    /// minimal one.
    fn create_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<PersistedMessage, StoreError>;

    /// Sets the read flag on a message.
    fn mark_message_read(&self, message_id: &str) -> Result<(), StoreError>;

    fn get_message(&self, message_id: &str) -> Result<Option<PersistedMessage>, StoreError>;

    /// Returns the total number of stored messages.
    fn message_count(&self) -> Result<usize, StoreError>;
}

impl UserProfile {
    /// Profile for an identity the relay has only seen on the wire.
    pub fn minimal(user_id: &str) -> Self {
        UserProfile {
            id: user_id.to_string(),
            name: None,
            email: format!("{}@users.invalid", user_id),
            image: None,
        }
    }
}

/// Current time truncated to milliseconds, the precision both backends keep.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// ============================================================================
// In-Memory Storage (for testing and development)
// ============================================================================

#[derive(Debug, Clone)]
struct MessageRow {
    content: String,
    sender_id: String,
    receiver_id: String,
    read: bool,
    created_at: DateTime<Utc>,
}

/// In-memory storage for users and messages.
pub struct MemoryMessageStore {
    users: RwLock<HashMap<String, UserProfile>>,
    messages: RwLock<HashMap<String, MessageRow>>,
}

impl MemoryMessageStore {
    /// Creates a new empty in-memory storage.
    pub fn new() -> Self {
        MemoryMessageStore {
            users: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
        }
    }

    fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let users = self.users.read().map_err(|_| poisoned())?;
        Ok(users.get(user_id).cloned())
    }

    pub fn user_count(&self) -> usize {
        self.users.read().map(|users| users.len()).unwrap_or(0)
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("store lock poisoned".to_string())
}

impl MessageStore for MemoryMessageStore {
    fn upsert_user(&self, user: &UserProfile) -> Result<(), StoreError> {
        let mut users = self.users.write().map_err(|_| poisoned())?;
        users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn ensure_user(&self, user_id: &str) -> Result<UserProfile, StoreError> {
        let mut users = self.users.write().map_err(|_| poisoned())?;
        let profile = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::minimal(user_id));
        Ok(profile.clone())
    }

    fn create_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<PersistedMessage, StoreError> {
        let sender = self.ensure_user(sender_id)?;
        self.ensure_user(receiver_id)?;

        let id = uuid::Uuid::new_v4().to_string();
        let row = MessageRow {
            content: content.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            read: false,
            created_at: now_millis(),
        };
        let mut messages = self.messages.write().map_err(|_| poisoned())?;
        messages.insert(id.clone(), row.clone());

        Ok(PersistedMessage {
            id,
            content: row.content,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            read: row.read,
            created_at: row.created_at,
            sender,
        })
    }

    fn mark_message_read(&self, message_id: &str) -> Result<(), StoreError> {
        let mut messages = self.messages.write().map_err(|_| poisoned())?;
        match messages.get_mut(message_id) {
            Some(row) => {
                row.read = true;
                Ok(())
            }
            None => Err(StoreError::MessageNotFound(message_id.to_string())),
        }
    }

    fn get_message(&self, message_id: &str) -> Result<Option<PersistedMessage>, StoreError> {
        let row = {
            let messages = self.messages.read().map_err(|_| poisoned())?;
            match messages.get(message_id) {
                Some(row) => row.clone(),
                None => return Ok(None),
            }
        };
        let sender = self
            .profile(&row.sender_id)?
            .ok_or_else(|| StoreError::UnknownUser(row.sender_id.clone()))?;
        Ok(Some(PersistedMessage {
            id: message_id.to_string(),
            content: row.content,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            read: row.read,
            created_at: row.created_at,
            sender,
        }))
    }

    fn message_count(&self) -> Result<usize, StoreError> {
        let messages = self.messages.read().map_err(|_| poisoned())?;
        Ok(messages.len())
    }
}

// ============================================================================
// SQLite Storage (for production)
// ============================================================================

/// SQLite-backed persistent storage for users and messages.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT,
                email TEXT NOT NULL UNIQUE,
                image TEXT
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                sender_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                receiver_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                read INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages(sender_id, receiver_id);
            CREATE INDEX IF NOT EXISTS idx_messages_created
                ON messages(created_at_ms);",
        )?;

        Ok(SqliteMessageStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| poisoned())
    }
}

fn load_profile(conn: &Connection, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
    let profile = conn
        .query_row(
            "SELECT id, name, email, image FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(UserProfile {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    image: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(profile)
}

fn ensure_profile(conn: &Connection, user_id: &str) -> Result<UserProfile, StoreError> {
    if let Some(profile) = load_profile(conn, user_id)? {
        return Ok(profile);
    }
    let profile = UserProfile::minimal(user_id);
    conn.execute(
        "INSERT INTO users (id, name, email, image) VALUES (?1, NULL, ?2, NULL)
         ON CONFLICT(id) DO NOTHING",
        params![profile.id, profile.email],
    )?;
    Ok(profile)
}

impl MessageStore for SqliteMessageStore {
    fn upsert_user(&self, user: &UserProfile) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, name, email, image) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, email = excluded.email, image = excluded.image",
            params![user.id, user.name, user.email, user.image],
        )?;
        Ok(())
    }

    fn ensure_user(&self, user_id: &str) -> Result<UserProfile, StoreError> {
        let conn = self.conn()?;
        ensure_profile(&conn, user_id)
    }

    fn create_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<PersistedMessage, StoreError> {
        let conn = self.conn()?;
        let sender = ensure_profile(&conn, sender_id)?;
        ensure_profile(&conn, receiver_id)?;

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now_millis();
        conn.execute(
            "INSERT INTO messages (id, content, sender_id, receiver_id, read, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![id, content, sender_id, receiver_id, created_at.timestamp_millis()],
        )?;

        Ok(PersistedMessage {
            id,
            content: content.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            read: false,
            created_at,
            sender,
        })
    }

    fn mark_message_read(&self, message_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changes = conn.execute(
            "UPDATE messages SET read = 1 WHERE id = ?1",
            params![message_id],
        )?;
        if changes == 0 {
            return Err(StoreError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }

    fn get_message(&self, message_id: &str) -> Result<Option<PersistedMessage>, StoreError> {
        let conn = self.conn()?;
        let message = conn
            .query_row(
                "SELECT m.id, m.content, m.sender_id, m.receiver_id, m.read, m.created_at_ms,
                        u.name, u.email, u.image
                 FROM messages m JOIN users u ON u.id = m.sender_id
                 WHERE m.id = ?1",
                params![message_id],
                |row| {
                    let sender_id: String = row.get(2)?;
                    Ok(PersistedMessage {
                        id: row.get(0)?,
                        content: row.get(1)?,
                        receiver_id: row.get(3)?,
                        read: row.get(4)?,
                        created_at: DateTime::from_timestamp_millis(row.get(5)?)
                            .unwrap_or_default(),
                        sender: UserProfile {
                            id: sender_id.clone(),
                            name: row.get(6)?,
                            email: row.get(7)?,
                            image: row.get(8)?,
                        },
                        sender_id,
                    })
                },
            )
            .optional()?;
        Ok(message)
    }

    fn message_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// Creates a message store based on the backend type.
pub fn create_message_store(
    backend: StorageBackend,
    data_dir: &Path,
) -> Result<Box<dyn MessageStore>, StoreError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryMessageStore::new())),
        StorageBackend::Sqlite => {
            std::fs::create_dir_all(data_dir).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {}", data_dir.display(), e))
            })?;
            Ok(Box::new(SqliteMessageStore::open(data_dir.join("chat.db"))?))
        }
    }
}

/// The two demo accounts of a fresh install.
pub fn demo_users() -> Vec<UserProfile> {
    vec![
        UserProfile {
            id: "demo-sandesh".to_string(),
            name: Some("Sandesh Shrestha".to_string()),
            email: "sandeshshrestha@gmail.com".to_string(),
            image: None,
        },
        UserProfile {
            id: "demo-manasvi".to_string(),
            name: Some("Manasvi Kapoor".to_string()),
            email: "manasvikapoor@gmail.com".to_string(),
            image: None,
        },
    ]
}

/// Inserts the demo accounts. Idempotent.
pub fn seed_demo_users(store: &dyn MessageStore) -> Result<usize, StoreError> {
    let users = demo_users();
    for user in &users {
        store.upsert_user(user)?;
    }
    Ok(users.len())
}

// ============================================================================
// Tests
// ============================================================================
