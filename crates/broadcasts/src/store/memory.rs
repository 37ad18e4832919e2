//! In-memory contact store and message sink, used by tests and local runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use postroom_common::error::AppError;
use postroom_common::types::{Contact, ContactId, GroupId, Language, OrgId, OutgoingMsg, Urn};

use super::{ContactStore, MessageWriter};

#[derive(Debug, Default)]
struct State {
    contacts: BTreeMap<(OrgId, ContactId), Contact>,
    groups: HashMap<(OrgId, GroupId), BTreeSet<ContactId>>,
    messages: Vec<OutgoingMsg>,
    next_contact_id: i64,
}

impl State {
    fn insert_contact(
        &mut self,
        org_id: OrgId,
        name: &str,
        language: Option<Language>,
        urns: Vec<Urn>,
    ) -> ContactId {
        self.next_contact_id += 1;
        let id = ContactId(self.next_contact_id);
        self.contacts.insert(
            (org_id, id),
            Contact {
                id,
                uuid: Uuid::new_v4(),
                name: name.to_string(),
                language,
                urns,
            },
        );
        id
    }

    fn owner_of(&self, org_id: OrgId, urn: &Urn) -> Option<ContactId> {
        self.contacts
            .iter()
            .find(|((org, _), contact)| *org == org_id && contact.has_urn(urn))
            .map(|((_, id), _)| *id)
    }
}

/// Contacts, groups and written messages held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a contact, returning its new id.
    pub fn add_contact(
        &self,
        org_id: OrgId,
        name: &str,
        language: Option<Language>,
        urns: Vec<Urn>,
    ) -> ContactId {
        self.state().insert_contact(org_id, name, language, urns)
    }

    /// Append an address to an existing contact, at the lowest priority.
    pub fn add_urn(&self, org_id: OrgId, contact_id: ContactId, urn: Urn) -> Result<(), AppError> {
        let mut state = self.state();
        let contact = state
            .contacts
            .get_mut(&(org_id, contact_id))
            .ok_or_else(|| AppError::NotFound(format!("Contact {} not found", contact_id)))?;
        contact.urns.push(urn);
        Ok(())
    }

    pub fn add_to_group(&self, org_id: OrgId, group_id: GroupId, contact_id: ContactId) {
        self.state()
            .groups
            .entry((org_id, group_id))
            .or_default()
            .insert(contact_id);
    }

    pub fn contact_count(&self, org_id: OrgId) -> usize {
        self.state()
            .contacts
            .keys()
            .filter(|(org, _)| *org == org_id)
            .count()
    }

    /// Every message written so far.
    pub fn messages(&self) -> Vec<OutgoingMsg> {
        self.state().messages.clone()
    }

    pub fn message_count(&self) -> usize {
        self.state().messages.len()
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn group_contact_ids(
        &self,
        org_id: OrgId,
        group_ids: &[GroupId],
    ) -> Result<Vec<ContactId>, AppError> {
        let state = self.state();
        let members: BTreeSet<ContactId> = group_ids
            .iter()
            .filter_map(|group_id| state.groups.get(&(org_id, *group_id)))
            .flatten()
            .copied()
            .filter(|id| state.contacts.contains_key(&(org_id, *id)))
            .collect();
        Ok(members.into_iter().collect())
    }

    async fn contact_ids_for_urns(
        &self,
        org_id: OrgId,
        urns: &[Urn],
    ) -> Result<Vec<(Urn, ContactId)>, AppError> {
        let mut state = self.state();
        let resolved: Vec<(Urn, ContactId)> = urns
            .iter()
            .map(|urn| {
                let id = match state.owner_of(org_id, urn) {
                    Some(id) => id,
                    None => state.insert_contact(org_id, "", None, vec![urn.clone()]),
                };
                (urn.clone(), id)
            })
            .collect();
        Ok(resolved)
    }

    async fn load_contacts(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> Result<Vec<Contact>, AppError> {
        let state = self.state();
        Ok(contact_ids
            .iter()
            .filter_map(|id| state.contacts.get(&(org_id, *id)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageWriter for MemoryStore {
    async fn write_messages(&self, msgs: &[OutgoingMsg]) -> Result<usize, AppError> {
        self.state().messages.extend_from_slice(msgs);
        Ok(msgs.len())
    }
}
