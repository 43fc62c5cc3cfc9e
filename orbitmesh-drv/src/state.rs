//  STATE.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the host's persisted-state facade: the explicit schema
//!   version row with its idempotent migration runner, and the admin API
//!   token store. The actual stores are in-memory here; persistent
//!   backends slot in behind the same shapes.
//

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::info;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{Rng as _, thread_rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};


/***** CONSTANTS *****/
/// The length of a freshly generated API token secret.
const TOKEN_SECRET_LEN: usize = 40;





/***** AUXILLARY *****/
/// The explicit schema version row (always `id = 1`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SchemaVersion {
    /// Always 1; the row is a singleton.
    pub id: u32,
    /// The schema version the stores are at.
    pub version: u32,
    /// When the version last changed.
    pub updated_at: DateTime<Utc>,
    /// What the last migration did.
    pub last_migration_description: String,
}
impl Default for SchemaVersion {
    #[inline]
    fn default() -> Self { Self { id: 1, version: 0, updated_at: Utc::now(), last_migration_description: String::new() } }
}

/// One migration step. Steps run in ascending version order and are idempotent: a step at or
/// below the current version is skipped.
#[derive(Clone, Copy, Debug)]
pub struct Migration {
    /// The version this step brings the schema to.
    pub version: u32,
    /// What it does.
    pub description: &'static str,
}

/// The migration ladder of this host version.
pub const MIGRATIONS: [Migration; 3] = [
    Migration { version: 1, description: "initial schema: workflows, instances, enrollments, bootstrap token" },
    Migration { version: 2, description: "admin api tokens" },
    Migration { version: 3, description: "deployment profiles and executions" },
];



/// One admin API token. Only the hash of the secret is stored.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApiToken {
    /// Stable id of the token.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Hex-encoded SHA-256 of the secret.
    pub hash: String,
    /// When the token was created.
    pub created_at: DateTime<Utc>,
    /// When the token was last used to authenticate, if ever.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Whether the token was revoked.
    pub revoked: bool,
}





/***** HELPER FUNCTIONS *****/
/// Hashes a token secret for storage and comparison.
#[inline]
fn hash_secret(secret: &str) -> String { hex::encode(Sha256::digest(secret.as_bytes())) }





/***** LIBRARY *****/
/// The admin API token store.
#[derive(Debug, Default)]
pub struct ApiTokenStore {
    /// All tokens, keyed by id.
    tokens: DashMap<String, ApiToken>,
}
impl ApiTokenStore {
    /// Constructor for an empty ApiTokenStore.
    #[inline]
    pub fn new() -> Self { Self::default() }

    /// Creates a new token.
    ///
    /// # Arguments
    /// - `name`: A human-readable label.
    ///
    /// # Returns
    /// The stored record plus the one-time-visible plaintext secret.
    pub fn create(&self, name: impl Into<String>) -> (ApiToken, String) {
        let secret: String = thread_rng().sample_iter(&Alphanumeric).take(TOKEN_SECRET_LEN).map(char::from).collect();
        let token: ApiToken = ApiToken {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            hash: hash_secret(&secret),
            created_at: Utc::now(),
            last_used_at: None,
            revoked: false,
        };
        self.tokens.insert(token.id.clone(), token.clone());
        (token, secret)
    }

    /// Verifies a presented secret, stamping the token's last use on success.
    ///
    /// # Returns
    /// True if a live (non-revoked) token matches.
    pub fn verify(&self, secret: &str) -> bool {
        let hash: String = hash_secret(secret);
        for mut entry in self.tokens.iter_mut() {
            if !entry.revoked && entry.hash == hash {
                entry.last_used_at = Some(Utc::now());
                return true;
            }
        }
        false
    }

    /// Revokes the given token.
    ///
    /// # Returns
    /// True if the token existed.
    pub fn revoke(&self, token_id: &str) -> bool {
        match self.tokens.get_mut(token_id) {
            Some(mut token) => {
                token.revoked = true;
                true
            },
            None => false,
        }
    }

    /// Returns clones of all tokens, oldest first.
    pub fn list(&self) -> Vec<ApiToken> {
        let mut tokens: Vec<ApiToken> = self.tokens.iter().map(|entry| entry.clone()).collect();
        tokens.sort_by(|lhs, rhs| lhs.created_at.cmp(&rhs.created_at));
        tokens
    }
}



/// The persisted-state facade: schema version plus the stores that need migrations.
#[derive(Debug, Default)]
pub struct HostState {
    /// The schema version row.
    schema: Mutex<SchemaVersion>,
    /// The admin API tokens.
    pub tokens: ApiTokenStore,
}
impl HostState {
    /// Constructor for the HostState at schema version 0 (pre-migration).
    #[inline]
    pub fn new() -> Self { Self::default() }

    /// Returns a snapshot of the schema version row.
    #[inline]
    pub fn schema_version(&self) -> SchemaVersion { self.schema.lock().clone() }

    /// Runs every pending migration, in ascending version order. Re-running is a no-op.
    ///
    /// # Returns
    /// How many steps were applied.
    pub fn run_migrations(&self) -> usize {
        let mut schema = self.schema.lock();
        let mut applied: usize = 0;
        for migration in MIGRATIONS {
            if migration.version <= schema.version {
                continue;
            }
            // The in-memory stores need no structural work; the row records the step
            info!("Applying schema migration v{}: {}", migration.version, migration.description);
            schema.version = migration.version;
            schema.updated_at = Utc::now();
            schema.last_migration_description = migration.description.into();
            applied += 1;
        }
        applied
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let state: HostState = HostState::new();
        assert_eq!(state.schema_version().version, 0);

        let applied: usize = state.run_migrations();
        assert_eq!(applied, MIGRATIONS.len());
        let schema: SchemaVersion = state.schema_version();
        assert_eq!(schema.id, 1);
        assert_eq!(schema.version, MIGRATIONS.last().unwrap().version);
        assert_eq!(schema.last_migration_description, MIGRATIONS.last().unwrap().description);

        // A second run applies nothing
        assert_eq!(state.run_migrations(), 0);
    }

    #[test]
    fn test_token_lifecycle() {
        let store: ApiTokenStore = ApiTokenStore::new();
        let (token, secret): (ApiToken, String) = store.create("ci");

        assert!(store.verify(&secret));
        assert!(!store.verify("wrong"));
        // Verification stamps last use
        assert!(store.list()[0].last_used_at.is_some());

        assert!(store.revoke(&token.id));
        assert!(!store.verify(&secret));
        assert!(!store.revoke("ghost"));
    }
}
