// identity/mod.rs — Identity reconciliation.
//
// Stateless per-request pipeline: snapshot the matching contacts,
// compute a mutation plan as a pure function of (snapshot, request),
// apply the plan, re-fetch the consolidated component, build the
// response. Keeping the plan pure means no in-memory list has to be
// kept in sync with writes mid-request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Contact, ContactStore, LinkPrecedence, LinkUpdate, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum IdentifyError {
    /// A matched component with no primary record — corrupted link graph.
    /// Never masked: recovering silently risks duplicating primaries.
    #[error("no primary contact found in matched component")]
    MissingPrimary,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentifyRequest {
    pub email: Option<String>,
    #[serde(rename = "phoneNumber")]
    pub phone_number: Option<String>,
}

/// Consolidated view of one identity cluster.
///
/// Value ordering contract: the primary's own email/phone comes first in
/// its list, the remaining distinct values follow in order of the
/// `created_at` of the record that introduced each.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedContact {
    #[serde(rename = "primaryContactId")]
    pub primary_contact_id: i64,
    pub emails: Vec<String>,
    #[serde(rename = "phoneNumbers")]
    pub phone_numbers: Vec<String>,
    #[serde(rename = "secondaryContactIds")]
    pub secondary_contact_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyResponse {
    pub contact: ConsolidatedContact,
}

/// Record the plan wants created, if any. Email/phone always come from
/// the request itself.
#[derive(Debug, Clone, PartialEq)]
struct CreateSpec {
    linked_id: Option<i64>,
    precedence: LinkPrecedence,
}

/// Full set of store mutations for one request, computed before any
/// write is issued.
#[derive(Debug, Default, PartialEq)]
struct MutationPlan {
    create: Option<CreateSpec>,
    updates: Vec<(i64, LinkUpdate)>,
}

pub struct IdentityResolver {
    store: Arc<dyn ContactStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self { store }
    }

    /// Resolve one identification request into a consolidated contact.
    pub async fn identify(&self, req: &IdentifyRequest) -> Result<IdentifyResponse, IdentifyError> {
        let email = req.email.as_deref();
        let phone = req.phone_number.as_deref();

        let snapshot = self.store.find_by_email_or_phone(email, phone).await?;

        // No matches: this is the only path that creates a primary.
        if snapshot.is_empty() {
            let created = self
                .store
                .create(phone, email, None, LinkPrecedence::Primary)
                .await?;
            info!(contact_id = created.id, "created new primary contact");
            return Ok(IdentifyResponse {
                contact: build_consolidated(&[created])?,
            });
        }

        let plan = build_plan(&snapshot, req)?;
        debug!(
            matched = snapshot.len(),
            creates = plan.create.is_some(),
            updates = plan.updates.len(),
            "computed mutation plan"
        );

        let mut ids: Vec<i64> = snapshot.iter().map(|c| c.id).collect();
        if let Some(spec) = &plan.create {
            let created = self
                .store
                .create(phone, email, spec.linked_id, spec.precedence)
                .await?;
            info!(
                contact_id = created.id,
                linked_id = ?created.linked_id,
                "created secondary contact"
            );
            ids.push(created.id);
        }

        // Merge writes go out one at a time, all before the response is
        // built. A crash mid-loop leaves a valid-but-incomplete graph
        // that the next request on this chain self-heals.
        for (id, update) in plan.updates {
            self.store.update_link(id, update).await?;
        }

        // Response always reflects persisted state, not the stale snapshot.
        let component = self.store.find_connected_component(&ids).await?;
        Ok(IdentifyResponse {
            contact: build_consolidated(&component)?,
        })
    }
}

/// Compute every mutation the request requires, from the snapshot alone.
/// The snapshot is non-empty here; the empty case creates a primary
/// before planning.
fn build_plan(snapshot: &[Contact], req: &IdentifyRequest) -> Result<MutationPlan, IdentifyError> {
    let email = req.email.as_deref();
    let phone = req.phone_number.as_deref();

    // Exact duplicate: some record carries exactly this email AND phone,
    // absent values counting as equal. Never creates a record.
    let exact_match = snapshot
        .iter()
        .any(|c| c.email.as_deref() == email && c.phone_number.as_deref() == phone);

    let has_new_email =
        email.is_some() && !snapshot.iter().any(|c| c.email.as_deref() == email);
    let has_new_phone =
        phone.is_some() && !snapshot.iter().any(|c| c.phone_number.as_deref() == phone);

    let create = if !exact_match && (has_new_email || has_new_phone) {
        let primary = earliest_primary(snapshot).ok_or(IdentifyError::MissingPrimary)?;
        Some(CreateSpec {
            linked_id: Some(primary.id),
            precedence: LinkPrecedence::Secondary,
        })
    } else {
        None
    };

    // Primaries bridged by this request. More than one means two
    // previously independent chains must merge.
    let mut bridged: Vec<&Contact> = snapshot
        .iter()
        .filter(|c| {
            c.is_primary()
                && ((email.is_some() && c.email.as_deref() == email)
                    || (phone.is_some() && c.phone_number.as_deref() == phone))
        })
        .collect();
    bridged.sort_by(|a, b| a.created_key().cmp(&b.created_key()));

    let mut updates = Vec::new();
    if bridged.len() > 1 {
        let survivor = bridged[0];
        // Two passes per demoted primary: demote it, then re-point its
        // children so link depth stays at 1.
        for demoted in &bridged[1..] {
            updates.push((
                demoted.id,
                LinkUpdate {
                    linked_id: Some(survivor.id),
                    link_precedence: Some(LinkPrecedence::Secondary),
                },
            ));
            for child in snapshot.iter().filter(|c| c.linked_id == Some(demoted.id)) {
                updates.push((
                    child.id,
                    LinkUpdate {
                        linked_id: Some(survivor.id),
                        link_precedence: None,
                    },
                ));
            }
        }
    }

    Ok(MutationPlan { create, updates })
}

fn earliest_primary(contacts: &[Contact]) -> Option<&Contact> {
    contacts
        .iter()
        .filter(|c| c.is_primary())
        .min_by(|a, b| a.created_key().cmp(&b.created_key()))
}

/// Build the consolidated view from the final set of component members.
fn build_consolidated(contacts: &[Contact]) -> Result<ConsolidatedContact, IdentifyError> {
    let primary = earliest_primary(contacts).ok_or(IdentifyError::MissingPrimary)?;

    let mut by_age: Vec<&Contact> = contacts.iter().collect();
    by_age.sort_by(|a, b| a.created_key().cmp(&b.created_key()));

    let emails = ordered_values(&by_age, primary, |c| c.email.as_deref());
    let phone_numbers = ordered_values(&by_age, primary, |c| c.phone_number.as_deref());

    let mut secondary_contact_ids: Vec<i64> = contacts
        .iter()
        .filter(|c| !c.is_primary())
        .map(|c| c.id)
        .collect();
    secondary_contact_ids.sort_unstable();

    Ok(ConsolidatedContact {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids,
    })
}

/// Distinct non-null values: the primary's own first, the rest in
/// creation order of the record that introduced each value.
fn ordered_values<'a>(
    by_age: &[&'a Contact],
    primary: &'a Contact,
    field: impl Fn(&'a Contact) -> Option<&'a str>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(v) = field(primary) {
        out.push(v.to_string());
    }
    for &c in by_age {
        if let Some(v) = field(c) {
            if !out.iter().any(|seen| seen == v) {
                out.push(v.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteContactStore;
    use sqlx::SqlitePool;

    fn req(email: Option<&str>, phone: Option<&str>) -> IdentifyRequest {
        IdentifyRequest {
            email: email.map(String::from),
            phone_number: phone.map(String::from),
        }
    }

    fn contact(
        id: i64,
        email: Option<&str>,
        phone: Option<&str>,
        linked_id: Option<i64>,
        precedence: LinkPrecedence,
        created_at: &str,
    ) -> Contact {
        Contact {
            id,
            phone_number: phone.map(String::from),
            email: email.map(String::from),
            linked_id,
            link_precedence: precedence,
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
            deleted_at: None,
        }
    }

    // ─── Plan computation (pure) ────────────────────────────────────────────

    #[test]
    fn test_plan_exact_duplicate_is_noop() {
        let snapshot = vec![contact(
            1,
            Some("a@x.com"),
            Some("111"),
            None,
            LinkPrecedence::Primary,
            "2024-01-01T00:00:00+00:00",
        )];
        let plan = build_plan(&snapshot, &req(Some("a@x.com"), Some("111"))).unwrap();
        assert_eq!(plan, MutationPlan::default());
    }

    #[test]
    fn test_plan_partial_match_without_new_information_is_noop() {
        // Request repeats known values split across two records.
        let snapshot = vec![
            contact(
                1,
                Some("a@x.com"),
                Some("111"),
                None,
                LinkPrecedence::Primary,
                "2024-01-01T00:00:00+00:00",
            ),
            contact(
                2,
                Some("b@x.com"),
                Some("111"),
                Some(1),
                LinkPrecedence::Secondary,
                "2024-01-02T00:00:00+00:00",
            ),
        ];
        let plan = build_plan(&snapshot, &req(Some("b@x.com"), Some("111"))).unwrap();
        assert!(plan.create.is_none());
        assert!(plan.updates.is_empty());
    }

    #[test]
    fn test_plan_new_email_creates_secondary_under_oldest_primary() {
        let snapshot = vec![contact(
            1,
            Some("a@x.com"),
            Some("111"),
            None,
            LinkPrecedence::Primary,
            "2024-01-01T00:00:00+00:00",
        )];
        let plan = build_plan(&snapshot, &req(Some("b@x.com"), Some("111"))).unwrap();
        assert_eq!(
            plan.create,
            Some(CreateSpec {
                linked_id: Some(1),
                precedence: LinkPrecedence::Secondary,
            })
        );
        assert!(plan.updates.is_empty());
    }

    #[test]
    fn test_plan_missing_primary_is_consistency_error() {
        // Only a secondary matched and its primary shares neither value.
        let snapshot = vec![contact(
            2,
            Some("b@x.com"),
            Some("111"),
            Some(1),
            LinkPrecedence::Secondary,
            "2024-01-02T00:00:00+00:00",
        )];
        let err = build_plan(&snapshot, &req(Some("b@x.com"), Some("999"))).unwrap_err();
        assert!(matches!(err, IdentifyError::MissingPrimary));
    }

    #[test]
    fn test_plan_merge_demotes_newer_primary_and_repoints_children() {
        let snapshot = vec![
            contact(
                1,
                Some("g@x.com"),
                Some("919191"),
                None,
                LinkPrecedence::Primary,
                "2024-01-01T00:00:00+00:00",
            ),
            contact(
                2,
                Some("b@x.com"),
                Some("717171"),
                None,
                LinkPrecedence::Primary,
                "2024-02-01T00:00:00+00:00",
            ),
            contact(
                3,
                Some("c@x.com"),
                Some("717171"),
                Some(2),
                LinkPrecedence::Secondary,
                "2024-02-02T00:00:00+00:00",
            ),
        ];
        let plan = build_plan(&snapshot, &req(Some("g@x.com"), Some("717171"))).unwrap();
        // No new values, so no record; the bridge only merges.
        assert!(plan.create.is_none());
        assert_eq!(
            plan.updates,
            vec![
                (
                    2,
                    LinkUpdate {
                        linked_id: Some(1),
                        link_precedence: Some(LinkPrecedence::Secondary),
                    }
                ),
                (
                    3,
                    LinkUpdate {
                        linked_id: Some(1),
                        link_precedence: None,
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_plan_single_matching_primary_never_merges() {
        let snapshot = vec![contact(
            1,
            Some("a@x.com"),
            Some("111"),
            None,
            LinkPrecedence::Primary,
            "2024-01-01T00:00:00+00:00",
        )];
        // New email bridges nothing: one primary, no merge updates.
        let plan = build_plan(&snapshot, &req(Some("n@x.com"), Some("111"))).unwrap();
        assert_eq!(
            plan.create,
            Some(CreateSpec {
                linked_id: Some(1),
                precedence: LinkPrecedence::Secondary,
            })
        );
        assert!(plan.updates.is_empty());
    }

    // ─── End to end over SQLite ─────────────────────────────────────────────

    async fn make_resolver() -> (IdentityResolver, Arc<SqliteContactStore>) {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let store = Arc::new(SqliteContactStore::new(pool));
        store.migrate().await.unwrap();
        (IdentityResolver::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_new_customer_creates_primary() {
        let (resolver, _store) = make_resolver().await;
        let resp = resolver
            .identify(&req(Some("lorraine@hillvalley.edu"), Some("123456")))
            .await
            .unwrap();
        assert_eq!(resp.contact.emails, vec!["lorraine@hillvalley.edu"]);
        assert_eq!(resp.contact.phone_numbers, vec!["123456"]);
        assert!(resp.contact.secondary_contact_ids.is_empty());
    }

    #[tokio::test]
    async fn test_repeat_request_is_idempotent() {
        let (resolver, store) = make_resolver().await;
        let first = resolver
            .identify(&req(Some("a@x.com"), Some("111")))
            .await
            .unwrap();
        let second = resolver
            .identify(&req(Some("a@x.com"), Some("111")))
            .await
            .unwrap();
        assert_eq!(first, second);

        let rows = store
            .find_by_email_or_phone(Some("a@x.com"), Some("111"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_new_email_links_secondary_to_primary() {
        let (resolver, store) = make_resolver().await;
        let first = resolver
            .identify(&req(Some("lorraine@hillvalley.edu"), Some("123456")))
            .await
            .unwrap();
        let primary_id = first.contact.primary_contact_id;

        let resp = resolver
            .identify(&req(Some("mcfly@hillvalley.edu"), Some("123456")))
            .await
            .unwrap();
        assert_eq!(resp.contact.primary_contact_id, primary_id);
        assert_eq!(
            resp.contact.emails,
            vec!["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"]
        );
        assert_eq!(resp.contact.phone_numbers, vec!["123456"]);
        assert_eq!(resp.contact.secondary_contact_ids.len(), 1);

        let secondary = store
            .get(resp.contact.secondary_contact_ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(secondary.linked_id, Some(primary_id));
        assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
    }

    #[tokio::test]
    async fn test_email_only_and_phone_only_requests_consolidate() {
        let (resolver, _store) = make_resolver().await;
        let created = resolver
            .identify(&req(Some("a@x.com"), Some("111")))
            .await
            .unwrap();

        let by_email = resolver.identify(&req(Some("a@x.com"), None)).await.unwrap();
        assert_eq!(by_email, created);

        let by_phone = resolver.identify(&req(None, Some("111"))).await.unwrap();
        assert_eq!(by_phone, created);
    }

    #[tokio::test]
    async fn test_merge_keeps_earliest_primary() {
        let (resolver, store) = make_resolver().await;
        let p1 = resolver
            .identify(&req(Some("george@hillvalley.edu"), Some("919191")))
            .await
            .unwrap()
            .contact
            .primary_contact_id;
        let p2 = resolver
            .identify(&req(Some("biffsucks@hillvalley.edu"), Some("717171")))
            .await
            .unwrap()
            .contact
            .primary_contact_id;
        assert_ne!(p1, p2);

        let resp = resolver
            .identify(&req(Some("george@hillvalley.edu"), Some("717171")))
            .await
            .unwrap();
        assert_eq!(resp.contact.primary_contact_id, p1);
        assert_eq!(
            resp.contact.emails,
            vec!["george@hillvalley.edu", "biffsucks@hillvalley.edu"]
        );
        assert_eq!(resp.contact.phone_numbers, vec!["919191", "717171"]);
        assert_eq!(resp.contact.secondary_contact_ids, vec![p2]);

        let demoted = store.get(p2).await.unwrap().unwrap();
        assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(demoted.linked_id, Some(p1));
    }

    #[tokio::test]
    async fn test_merge_flattens_chains_to_depth_one() {
        let (resolver, store) = make_resolver().await;
        // Cluster 1: primary + secondary.
        let p1 = resolver
            .identify(&req(Some("a@x.com"), Some("111")))
            .await
            .unwrap()
            .contact
            .primary_contact_id;
        // Cluster 2: primary + secondary.
        let p2 = resolver
            .identify(&req(Some("b@x.com"), Some("222")))
            .await
            .unwrap()
            .contact
            .primary_contact_id;
        resolver
            .identify(&req(Some("b2@x.com"), Some("222")))
            .await
            .unwrap();

        // Bridge the clusters.
        let resp = resolver
            .identify(&req(Some("a@x.com"), Some("222")))
            .await
            .unwrap();
        assert_eq!(resp.contact.primary_contact_id, p1);

        // No record may point at a record that is itself secondary.
        let component = store.find_connected_component(&[p1, p2]).await.unwrap();
        for c in &component {
            if let Some(linked) = c.linked_id {
                let target = store.get(linked).await.unwrap().unwrap();
                assert!(
                    target.is_primary(),
                    "contact {} links to non-primary {}",
                    c.id,
                    target.id
                );
            }
        }
    }

    #[tokio::test]
    async fn test_response_has_primary_values_first_and_no_duplicates() {
        let (resolver, _store) = make_resolver().await;
        resolver
            .identify(&req(Some("a@x.com"), Some("111")))
            .await
            .unwrap();
        resolver
            .identify(&req(Some("b@x.com"), Some("111")))
            .await
            .unwrap();
        resolver
            .identify(&req(Some("c@x.com"), Some("111")))
            .await
            .unwrap();
        let resp = resolver
            .identify(&req(Some("b@x.com"), Some("111")))
            .await
            .unwrap();

        assert_eq!(resp.contact.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
        assert_eq!(resp.contact.phone_numbers, vec!["111"]);
        let mut deduped = resp.contact.emails.clone();
        deduped.dedup();
        assert_eq!(deduped, resp.contact.emails);
    }

    #[tokio::test]
    async fn test_missing_primary_surfaces_as_internal_error() {
        let (resolver, store) = make_resolver().await;
        // Forge a secondary whose primary shares neither request value.
        let p = store
            .create(Some("999"), Some("other@x.com"), None, LinkPrecedence::Primary)
            .await
            .unwrap();
        store
            .create(Some("111"), Some("b@x.com"), Some(p.id), LinkPrecedence::Secondary)
            .await
            .unwrap();

        let err = resolver
            .identify(&req(Some("b@x.com"), Some("555")))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentifyError::MissingPrimary));
    }

    #[tokio::test]
    async fn test_request_with_one_null_field_matches_record_with_both() {
        let (resolver, store) = make_resolver().await;
        resolver
            .identify(&req(Some("a@x.com"), Some("111")))
            .await
            .unwrap();

        // Known email, no phone: not an exact duplicate of {a, 111} but
        // carries no new information either — nothing is created.
        let resp = resolver.identify(&req(Some("a@x.com"), None)).await.unwrap();
        assert!(resp.contact.secondary_contact_ids.is_empty());
        let rows = store
            .find_by_email_or_phone(Some("a@x.com"), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
