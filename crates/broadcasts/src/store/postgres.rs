//! Postgres-backed contact store and message writer.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use postroom_common::error::AppError;
use postroom_common::types::{Contact, ContactId, GroupId, Language, OrgId, OutgoingMsg, Urn};

use super::{ContactStore, MessageWriter};

/// Priority given to addresses created for unknown URNs.
const DEFAULT_URN_PRIORITY: i32 = 50;

#[derive(Debug, sqlx::FromRow)]
struct ContactRow {
    id: ContactId,
    uuid: Uuid,
    name: String,
    language: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct UrnRow {
    contact_id: ContactId,
    identity: String,
}

/// Contact store and message writer over a sqlx Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn urn_owner(
    tx: &mut Transaction<'_, Postgres>,
    org_id: OrgId,
    urn: &Urn,
) -> Result<Option<ContactId>, AppError> {
    let row: Option<(ContactId,)> =
        sqlx::query_as("SELECT contact_id FROM contact_urns WHERE org_id = $1 AND identity = $2")
            .bind(org_id)
            .bind(urn.as_str())
            .fetch_optional(&mut **tx)
            .await?;
    Ok(row.map(|(id,)| id))
}

/// Resolve `urn` to its contact, creating one when the URN is new.
///
/// A concurrent resolution of the same URN may claim it first. The insert then
/// waits for that transaction, finds the conflict and hands back the winner.
async fn get_or_create_contact(
    tx: &mut Transaction<'_, Postgres>,
    org_id: OrgId,
    urn: &Urn,
) -> Result<ContactId, AppError> {
    if let Some(id) = urn_owner(tx, org_id, urn).await? {
        return Ok(id);
    }

    let (id,): (ContactId,) =
        sqlx::query_as("INSERT INTO contacts (uuid, org_id) VALUES ($1, $2) RETURNING id")
            .bind(Uuid::new_v4())
            .bind(org_id)
            .fetch_one(&mut **tx)
            .await?;

    let inserted: Option<(ContactId,)> = sqlx::query_as(
        r#"
        INSERT INTO contact_urns (org_id, contact_id, scheme, path, identity, priority)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (org_id, identity) DO NOTHING
        RETURNING contact_id
        "#,
    )
    .bind(org_id)
    .bind(id)
    .bind(urn.scheme())
    .bind(urn.path())
    .bind(urn.as_str())
    .bind(DEFAULT_URN_PRIORITY)
    .fetch_optional(&mut **tx)
    .await?;

    if inserted.is_some() {
        tracing::debug!(org_id = %org_id, contact_id = %id, urn = %urn, "Contact created for URN");
        return Ok(id);
    }

    sqlx::query("DELETE FROM contacts WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    let owner = urn_owner(tx, org_id, urn).await?;
    owner.ok_or_else(|| AppError::Internal(format!("URN {} conflicted but has no owner", urn)))
}

fn raw_ids<T: Copy>(ids: &[T], inner: impl Fn(T) -> i64) -> Vec<i64> {
    ids.iter().copied().map(inner).collect()
}

#[async_trait]
impl ContactStore for PgStore {
    async fn group_contact_ids(
        &self,
        org_id: OrgId,
        group_ids: &[GroupId],
    ) -> Result<Vec<ContactId>, AppError> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(ContactId,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT m.contact_id
            FROM contact_group_members m
            JOIN contacts c ON c.id = m.contact_id
            WHERE c.org_id = $1 AND c.is_active AND m.group_id = ANY($2)
            ORDER BY m.contact_id
            "#,
        )
        .bind(org_id)
        .bind(raw_ids(group_ids, |g| g.0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn contact_ids_for_urns(
        &self,
        org_id: OrgId,
        urns: &[Urn],
    ) -> Result<Vec<(Urn, ContactId)>, AppError> {
        // concurrent resolutions must lock URNs in the same order
        let mut ordered: Vec<&Urn> = urns.iter().collect();
        ordered.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ordered.dedup_by(|a, b| a.as_str() == b.as_str());

        let mut claimed: HashMap<&str, ContactId> = HashMap::with_capacity(ordered.len());
        let mut tx = self.pool.begin().await?;
        for urn in ordered {
            let contact_id = get_or_create_contact(&mut tx, org_id, urn).await?;
            claimed.insert(urn.as_str(), contact_id);
        }
        tx.commit().await?;

        Ok(urns
            .iter()
            .filter_map(|urn| claimed.get(urn.as_str()).map(|id| (urn.clone(), *id)))
            .collect())
    }

    async fn load_contacts(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> Result<Vec<Contact>, AppError> {
        if contact_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = raw_ids(contact_ids, |c| c.0);

        let contacts: Vec<ContactRow> = sqlx::query_as(
            r#"
            SELECT id, uuid, name, language
            FROM contacts
            WHERE org_id = $1 AND is_active AND id = ANY($2)
            ORDER BY id
            "#,
        )
        .bind(org_id)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let urn_rows: Vec<UrnRow> = sqlx::query_as(
            r#"
            SELECT contact_id, identity
            FROM contact_urns
            WHERE org_id = $1 AND contact_id = ANY($2)
            ORDER BY contact_id, priority DESC, id
            "#,
        )
        .bind(org_id)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut urns: HashMap<ContactId, Vec<Urn>> = HashMap::new();
        for row in urn_rows {
            match Urn::parse(&row.identity) {
                Ok(urn) => urns.entry(row.contact_id).or_default().push(urn),
                Err(e) => tracing::warn!(
                    contact_id = %row.contact_id,
                    identity = %row.identity,
                    error = %e,
                    "Skipping unparseable URN"
                ),
            }
        }

        Ok(contacts
            .into_iter()
            .map(|row| Contact {
                id: row.id,
                uuid: row.uuid,
                name: row.name,
                language: row.language.map(Language::new),
                urns: urns.remove(&row.id).unwrap_or_default(),
            })
            .collect())
    }
}

#[async_trait]
impl MessageWriter for PgStore {
    async fn write_messages(&self, msgs: &[OutgoingMsg]) -> Result<usize, AppError> {
        if msgs.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for msg in msgs {
            sqlx::query(
                r#"
                INSERT INTO msgs (uuid, org_id, contact_id, contact_urn, broadcast_id, text, attachments, quick_replies, created_on)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(msg.uuid)
            .bind(msg.org_id)
            .bind(msg.contact_id)
            .bind(msg.urn.as_str())
            .bind(msg.broadcast_id)
            .bind(&msg.text)
            .bind(&msg.attachments)
            .bind(&msg.quick_replies)
            .bind(msg.created_on)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(msgs.len())
    }
}
