use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use postroom_common::types::{BroadcastId, ContactId, GroupId, Language, OrgId, Urn};

use crate::PlanError;

/// Message content in one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastTranslation {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub quick_replies: Vec<String>,
}

impl BroadcastTranslation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
            quick_replies: Vec::new(),
        }
    }
}

/// A request to send one message to a set of groups, contacts and raw
/// addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub org_id: OrgId,
    #[serde(default)]
    pub broadcast_id: Option<BroadcastId>,
    pub translations: BTreeMap<Language, BroadcastTranslation>,
    pub base_language: Language,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub urns: Vec<Urn>,
}

impl Broadcast {
    /// A broadcast with a single translation and no targets yet.
    pub fn new(org_id: OrgId, base_language: Language, translation: BroadcastTranslation) -> Self {
        let mut translations = BTreeMap::new();
        translations.insert(base_language.clone(), translation);
        Self {
            org_id,
            broadcast_id: None,
            translations,
            base_language,
            group_ids: Vec::new(),
            contact_ids: Vec::new(),
            urns: Vec::new(),
        }
    }

    pub fn with_groups(mut self, group_ids: impl IntoIterator<Item = GroupId>) -> Self {
        self.group_ids.extend(group_ids);
        self
    }

    pub fn with_contacts(mut self, contact_ids: impl IntoIterator<Item = ContactId>) -> Self {
        self.contact_ids.extend(contact_ids);
        self
    }

    pub fn with_urns(mut self, urns: impl IntoIterator<Item = Urn>) -> Self {
        self.urns.extend(urns);
        self
    }

    /// True when no group, contact or address is targeted.
    pub fn has_no_targets(&self) -> bool {
        self.group_ids.is_empty() && self.contact_ids.is_empty() && self.urns.is_empty()
    }

    /// Check the translation set is usable.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.translations.is_empty() {
            return Err(PlanError::NoTranslations);
        }
        if !self.translations.contains_key(&self.base_language) {
            return Err(PlanError::MissingBaseTranslation(self.base_language.clone()));
        }
        Ok(())
    }
}

/// One resolved recipient of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub contact_id: ContactId,
    /// Set when the contact was reached through an explicit address, which is
    /// then the one to send to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<Urn>,
}

/// A slice of a broadcast's recipients, processed as one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastBatch {
    pub org_id: OrgId,
    #[serde(default)]
    pub broadcast_id: Option<BroadcastId>,
    pub translations: BTreeMap<Language, BroadcastTranslation>,
    pub base_language: Language,
    pub recipients: Vec<Recipient>,
    pub is_last: bool,
}

impl BroadcastBatch {
    /// Pick the translation for a contact: their own language if we have it,
    /// then the base language, then whatever is available.
    pub fn translation_for(&self, language: Option<&Language>) -> Option<&BroadcastTranslation> {
        language
            .and_then(|lang| self.translations.get(lang))
            .or_else(|| self.translations.get(&self.base_language))
            .or_else(|| self.translations.values().next())
    }
}
