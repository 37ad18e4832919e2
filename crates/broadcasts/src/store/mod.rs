//! Contact lookup and message persistence used by the planner and sender.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use postroom_common::error::AppError;
use postroom_common::types::{Contact, ContactId, GroupId, OrgId, OutgoingMsg, Urn};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Read access to contacts, plus creation of contacts for unknown addresses.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Ids of the active members of any of `group_ids`, without duplicates.
    async fn group_contact_ids(
        &self,
        org_id: OrgId,
        group_ids: &[GroupId],
    ) -> Result<Vec<ContactId>, AppError>;

    /// Resolve each address to the contact owning it, creating a contact for
    /// addresses nobody owns yet. Output order follows `urns`.
    async fn contact_ids_for_urns(
        &self,
        org_id: OrgId,
        urns: &[Urn],
    ) -> Result<Vec<(Urn, ContactId)>, AppError>;

    /// Load contacts with their addresses. Unknown ids are left out.
    async fn load_contacts(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> Result<Vec<Contact>, AppError>;
}

/// Persists outgoing messages for the delivery subsystem to pick up.
#[async_trait]
pub trait MessageWriter: Send + Sync {
    /// Write all of `msgs` at once, returning how many were written.
    async fn write_messages(&self, msgs: &[OutgoingMsg]) -> Result<usize, AppError>;
}
