//! Identity resolver
//!
//! Collapses the identifiers a provider payload carries into exactly one
//! canonical user per real person. Candidate users come from the identity
//! graph; more than one candidate triggers a merge with the lowest-id
//! (oldest) user surviving. Merges are serialized per org.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{AuditEntry, IdentityHint, IdentityType, User, UserIdentity};

use crate::error::Result;

pub struct IdentityResolver {
    store: Arc<dyn Store>,
    /// Per-org serialization of merge operations
    merge_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            merge_locks: DashMap::new(),
        }
    }

    fn org_lock(&self, org_id: Uuid) -> Arc<Mutex<()>> {
        self.merge_locks
            .entry(org_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Resolve hints to a canonical user id, creating or merging users as
    /// needed. Anonymous events (no usable hints) resolve to `None`.
    pub async fn resolve(&self, org_id: Uuid, hints: &[IdentityHint]) -> Result<Option<Uuid>> {
        let hints = normalize_hints(hints);
        if hints.is_empty() {
            return Ok(None);
        }

        let mut candidates: Vec<Uuid> = Vec::new();
        for hint in &hints {
            if let Some(identity) = self
                .store
                .find_identity(org_id, hint.source, hint.id_type, &hint.external_id)
                .await?
            {
                if !candidates.contains(&identity.user_id) {
                    candidates.push(identity.user_id);
                }
            }
        }

        let user_id = match candidates.len() {
            0 => self.create_user_for_hints(org_id, &hints).await?,
            1 => candidates[0],
            _ => self.merge_users(org_id, candidates).await?,
        };

        // Attach any hints the graph does not know yet
        for hint in &hints {
            let identity = UserIdentity {
                id: Uuid::new_v4(),
                org_id,
                user_id,
                source: hint.source,
                id_type: hint.id_type,
                external_id: hint.external_id.clone(),
                metadata: hint.metadata.clone(),
                created_at: Utc::now(),
            };
            self.store.upsert_identity(identity).await?;
        }

        Ok(Some(user_id))
    }

    /// Resolution by external id only, used by the access-checks API.
    /// Looks across every source and id type; an ambiguous match prefers
    /// the most-recently-updated user.
    pub async fn resolve_external(&self, org_id: Uuid, external_id: &str) -> Result<Uuid> {
        let external_id = external_id.trim();

        let identities = self
            .store
            .find_identities_by_external_id(org_id, external_id)
            .await?;
        let mut candidates: Vec<Uuid> = Vec::new();
        for identity in &identities {
            if !candidates.contains(&identity.user_id) {
                candidates.push(identity.user_id);
            }
        }

        if candidates.is_empty() {
            if let Some(user) = self
                .store
                .find_user_by_external_user_id(org_id, external_id)
                .await?
            {
                return Ok(user.id);
            }
            let now = Utc::now();
            let user = self
                .store
                .create_user(User {
                    id: Uuid::new_v4(),
                    org_id,
                    email: None,
                    external_user_id: Some(external_id.to_string()),
                    created_at: now,
                    updated_at: now,
                })
                .await?;
            debug!(user_id = %user.id, "created user from external id");
            return Ok(user.id);
        }

        if candidates.len() == 1 {
            return Ok(candidates[0]);
        }

        // Ambiguous: prefer the most-recently-updated user
        let mut best = candidates[0];
        let mut best_updated = chrono::DateTime::<Utc>::MIN_UTC;
        for candidate in candidates {
            if let Some(user) = self.store.get_user(org_id, candidate).await? {
                if user.updated_at > best_updated {
                    best_updated = user.updated_at;
                    best = user.id;
                }
            }
        }
        Ok(best)
    }

    async fn create_user_for_hints(&self, org_id: Uuid, hints: &[IdentityHint]) -> Result<Uuid> {
        let email = hints
            .iter()
            .find(|h| h.id_type == IdentityType::Email)
            .map(|h| h.external_id.clone());
        let now = Utc::now();
        let user = self
            .store
            .create_user(User {
                id: Uuid::new_v4(),
                org_id,
                email,
                external_user_id: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        debug!(user_id = %user.id, "created user from identity hints");
        Ok(user.id)
    }

    /// Merge all candidates into the lowest-id user. Every FK is
    /// rewritten, the losers are deleted, and an audit entry records the
    /// merge.
    async fn merge_users(&self, org_id: Uuid, mut candidates: Vec<Uuid>) -> Result<Uuid> {
        let lock = self.org_lock(org_id);
        let _guard = lock.lock().await;

        candidates.sort();
        let survivor = candidates[0];
        let losers = &candidates[1..];

        let mut survivor_row = self
            .store
            .get_user(org_id, survivor)
            .await?
            .ok_or(revwatch_database::DatabaseError::NotFound { entity: "user" })?;

        for &loser in losers {
            if let Some(loser_row) = self.store.get_user(org_id, loser).await? {
                if survivor_row.email.is_none() {
                    survivor_row.email = loser_row.email.clone();
                }
                if survivor_row.external_user_id.is_none() {
                    survivor_row.external_user_id = loser_row.external_user_id.clone();
                }
            }
            self.store.reassign_user_rows(org_id, loser, survivor).await?;
            // The loser must be gone before the survivor claims its
            // unique external_user_id
            self.store.delete_user(org_id, loser).await?;
        }

        survivor_row.updated_at = Utc::now();
        self.store.update_user(survivor_row).await?;

        self.store
            .insert_audit(AuditEntry {
                id: Uuid::new_v4(),
                org_id,
                actor: "identity_resolver".to_string(),
                action: "user.merge".to_string(),
                entity_type: "user".to_string(),
                entity_id: Some(survivor.to_string()),
                detail: json!({
                    "survivor": survivor.to_string(),
                    "merged": losers.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
                }),
                created_at: Utc::now(),
            })
            .await?;

        info!(survivor = %survivor, merged = losers.len(), "merged duplicate users");
        Ok(survivor)
    }
}

/// Lowercase and trim emails; drop hints with empty identifiers
fn normalize_hints(hints: &[IdentityHint]) -> Vec<IdentityHint> {
    hints
        .iter()
        .filter(|h| !h.external_id.trim().is_empty())
        .map(|h| {
            let mut hint = h.clone();
            if hint.id_type == IdentityType::Email {
                hint.external_id = hint.external_id.trim().to_lowercase();
            } else {
                hint.external_id = hint.external_id.trim().to_string();
            }
            hint
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use revwatch_database::MemoryStore;
    use revwatch_shared::Source;

    fn resolver() -> (Arc<MemoryStore>, IdentityResolver) {
        let store = Arc::new(MemoryStore::new());
        let resolver = IdentityResolver::new(store.clone());
        (store, resolver)
    }

    #[tokio::test]
    async fn test_no_hints_resolves_to_none() {
        let (_, resolver) = resolver();
        let got = resolver.resolve(Uuid::new_v4(), &[]).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_new_hints_create_user_with_identities() {
        let (store, resolver) = resolver();
        let org = Uuid::new_v4();
        let hints = vec![
            IdentityHint::new(Source::Stripe, IdentityType::CustomerId, "cus_1"),
            IdentityHint::new(Source::Stripe, IdentityType::Email, "  Jane@Example.COM "),
        ];

        let user_id = resolver.resolve(org, &hints).await.unwrap().unwrap();
        let user = store.get_user(org, user_id).await.unwrap().unwrap();
        assert_eq!(user.email.as_deref(), Some("jane@example.com"));

        let identities = store.list_identities_for_user(org, user_id).await.unwrap();
        assert_eq!(identities.len(), 2);
    }

    #[tokio::test]
    async fn test_repeat_resolution_is_stable() {
        let (_, resolver) = resolver();
        let org = Uuid::new_v4();
        let hints = vec![IdentityHint::new(
            Source::Apple,
            IdentityType::OriginalTransactionId,
            "1000000123",
        )];

        let first = resolver.resolve(org, &hints).await.unwrap().unwrap();
        let second = resolver.resolve(org, &hints).await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_shared_email_links_sources_to_one_user() {
        let (store, resolver) = resolver();
        let org = Uuid::new_v4();

        let stripe = vec![
            IdentityHint::new(Source::Stripe, IdentityType::CustomerId, "cus_1"),
            IdentityHint::new(Source::Stripe, IdentityType::Email, "jane@example.com"),
        ];
        let apple = vec![
            IdentityHint::new(Source::Apple, IdentityType::OriginalTransactionId, "tx_1"),
            IdentityHint::new(Source::Apple, IdentityType::Email, "jane@example.com"),
        ];

        let a = resolver.resolve(org, &stripe).await.unwrap().unwrap();
        let b = resolver.resolve(org, &apple).await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(store.user_count(org).await, 1);
    }

    #[tokio::test]
    async fn test_merge_rewrites_rows_and_deletes_loser() {
        let (store, resolver) = resolver();
        let org = Uuid::new_v4();

        // Two users created independently
        let a = resolver
            .resolve(
                org,
                &[IdentityHint::new(Source::Stripe, IdentityType::CustomerId, "cus_1")],
            )
            .await
            .unwrap()
            .unwrap();
        let b = resolver
            .resolve(
                org,
                &[IdentityHint::new(
                    Source::Apple,
                    IdentityType::OriginalTransactionId,
                    "tx_1",
                )],
            )
            .await
            .unwrap()
            .unwrap();
        assert_ne!(a, b);

        // A payload carrying both identifiers forces the merge
        let merged = resolver
            .resolve(
                org,
                &[
                    IdentityHint::new(Source::Stripe, IdentityType::CustomerId, "cus_1"),
                    IdentityHint::new(Source::Apple, IdentityType::OriginalTransactionId, "tx_1"),
                ],
            )
            .await
            .unwrap()
            .unwrap();

        let survivor = a.min(b);
        assert_eq!(merged, survivor);
        assert_eq!(store.user_count(org).await, 1);

        // Every identity row points at the survivor
        let identities = store.list_identities_for_user(org, survivor).await.unwrap();
        assert_eq!(identities.len(), 2);

        // The merge is audited
        let audit = store.audit_entries(org).await;
        assert!(audit.iter().any(|e| e.action == "user.merge"));
    }

    #[tokio::test]
    async fn test_resolve_external_creates_then_finds() {
        let (_, resolver) = resolver();
        let org = Uuid::new_v4();

        let first = resolver.resolve_external(org, "app-user-7").await.unwrap();
        let second = resolver.resolve_external(org, "app-user-7").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_resolve_external_matches_identity_graph() {
        let (_, resolver) = resolver();
        let org = Uuid::new_v4();

        let via_hints = resolver
            .resolve(
                org,
                &[IdentityHint::new(Source::Stripe, IdentityType::CustomerId, "cus_9")],
            )
            .await
            .unwrap()
            .unwrap();

        let via_external = resolver.resolve_external(org, "cus_9").await.unwrap();
        assert_eq!(via_hints, via_external);
    }
}
