//! Renders and writes the messages for one broadcast batch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use postroom_common::types::{Contact, ContactId, OutgoingMsg, Urn};

use crate::SendError;
use crate::models::{BroadcastBatch, Recipient};
use crate::render::RenderContext;
use crate::store::{ContactStore, MessageWriter};

/// Renders a batch for each recipient and hands the messages to the writer.
#[derive(Clone)]
pub struct BatchSender {
    store: Arc<dyn ContactStore>,
    writer: Arc<dyn MessageWriter>,
}

impl BatchSender {
    pub fn new(store: Arc<dyn ContactStore>, writer: Arc<dyn MessageWriter>) -> Self {
        Self { store, writer }
    }

    /// Send `batch`, returning the number of messages written.
    ///
    /// Recipients that can't be messaged (unknown contact, no deliverable URN,
    /// nothing to say) are skipped. Only store or writer failures fail the
    /// batch.
    pub async fn send(&self, batch: &BroadcastBatch) -> Result<usize, SendError> {
        let ids: Vec<ContactId> = batch.recipients.iter().map(|r| r.contact_id).collect();
        let contacts: HashMap<ContactId, Contact> = self
            .store
            .load_contacts(batch.org_id, &ids)
            .await?
            .into_iter()
            .map(|contact| (contact.id, contact))
            .collect();

        let msgs: Vec<OutgoingMsg> = batch
            .recipients
            .iter()
            .filter_map(|recipient| {
                self.build_msg(batch, recipient, contacts.get(&recipient.contact_id))
            })
            .collect();

        let skipped = batch.recipients.len() - msgs.len();
        let written = if msgs.is_empty() {
            0
        } else {
            self.writer.write_messages(&msgs).await?
        };

        tracing::info!(
            org_id = %batch.org_id,
            broadcast_id = ?batch.broadcast_id,
            recipients = batch.recipients.len(),
            written,
            skipped,
            is_last = batch.is_last,
            "Broadcast batch sent"
        );

        Ok(written)
    }

    fn build_msg(
        &self,
        batch: &BroadcastBatch,
        recipient: &Recipient,
        contact: Option<&Contact>,
    ) -> Option<OutgoingMsg> {
        let Some(contact) = contact else {
            tracing::debug!(contact_id = %recipient.contact_id, "Skipping unknown contact");
            return None;
        };

        let Some(urn) = choose_urn(recipient, contact) else {
            tracing::debug!(contact_id = %contact.id, "Skipping contact without a deliverable URN");
            return None;
        };

        let translation = batch.translation_for(contact.language.as_ref())?;
        let ctx = RenderContext::new(contact, urn);
        let text = ctx.render(&translation.text);
        let attachments = ctx.render_all(&translation.attachments);
        let quick_replies = ctx.render_all(&translation.quick_replies);

        if text.trim().is_empty() && attachments.is_empty() {
            tracing::debug!(contact_id = %contact.id, "Skipping empty message");
            return None;
        }

        Some(OutgoingMsg {
            uuid: Uuid::new_v4(),
            org_id: batch.org_id,
            contact_id: contact.id,
            urn: urn.clone(),
            broadcast_id: batch.broadcast_id,
            text,
            attachments,
            quick_replies,
            created_on: Utc::now(),
        })
    }
}

/// The recipient's explicit address when it is deliverable, otherwise the
/// contact's preferred one.
fn choose_urn<'a>(recipient: &'a Recipient, contact: &'a Contact) -> Option<&'a Urn> {
    recipient
        .urn
        .as_ref()
        .filter(|urn| urn.is_valid())
        .or_else(|| contact.preferred_urn())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use postroom_common::error::AppError;
    use postroom_common::types::{Language, OrgId};

    use super::*;
    use crate::models::BroadcastTranslation;
    use crate::store::MemoryStore;

    const ORG: OrgId = OrgId(1);

    fn urn(raw: &str) -> Urn {
        Urn::parse(raw).unwrap()
    }

    fn batch(recipients: Vec<Recipient>) -> BroadcastBatch {
        let mut translations = BTreeMap::new();
        translations.insert(
            Language::new("eng"),
            BroadcastTranslation {
                text: "Hi @contact.first_name".to_string(),
                attachments: vec![],
                quick_replies: vec!["Yes".to_string(), "No".to_string()],
            },
        );
        translations.insert(
            Language::new("fra"),
            BroadcastTranslation::text("Salut @contact.first_name"),
        );
        BroadcastBatch {
            org_id: ORG,
            broadcast_id: None,
            translations,
            base_language: Language::new("eng"),
            recipients,
            is_last: true,
        }
    }

    fn to(contact_id: ContactId) -> Recipient {
        Recipient {
            contact_id,
            urn: None,
        }
    }

    fn sender(store: &Arc<MemoryStore>) -> BatchSender {
        BatchSender::new(store.clone(), store.clone())
    }

    #[tokio::test]
    async fn test_renders_per_contact_language() {
        let store = Arc::new(MemoryStore::new());
        let cathy = store.add_contact(
            ORG,
            "Cathy Quincy",
            Some(Language::new("fra")),
            vec![urn("tel:+12065551111")],
        );
        let bob = store.add_contact(ORG, "Bob Smith", None, vec![urn("tel:+12065552222")]);

        let written = sender(&store)
            .send(&batch(vec![to(cathy), to(bob)]))
            .await
            .unwrap();
        assert_eq!(written, 2);

        let msgs = store.messages();
        let text_for = |id: ContactId| {
            msgs.iter()
                .find(|m| m.contact_id == id)
                .unwrap()
                .text
                .clone()
        };
        assert_eq!(text_for(cathy), "Salut Cathy");
        assert_eq!(text_for(bob), "Hi Bob");
        let bob_msg = msgs.iter().find(|m| m.contact_id == bob).unwrap();
        assert_eq!(bob_msg.quick_replies, vec!["Yes", "No"]);
    }

    #[tokio::test]
    async fn test_invalid_urn_skipped_without_failing() {
        let store = Arc::new(MemoryStore::new());
        let george = store.add_contact(ORG, "George", None, vec![urn("twitter:invalid-urn")]);
        let bob = store.add_contact(ORG, "Bob", None, vec![urn("tel:+12065552222")]);

        let written = sender(&store)
            .send(&batch(vec![to(george), to(bob), to(ContactId(404))]))
            .await
            .unwrap();

        assert_eq!(written, 1);
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_explicit_urn_used_when_valid() {
        let store = Arc::new(MemoryStore::new());
        let cathy = store.add_contact(ORG, "Cathy", None, vec![urn("tel:+12065551111")]);
        store.add_urn(ORG, cathy, urn("tel:+12065551212")).unwrap();

        let recipient = Recipient {
            contact_id: cathy,
            urn: Some(urn("tel:+12065551212")),
        };
        sender(&store).send(&batch(vec![recipient])).await.unwrap();

        assert_eq!(store.messages()[0].urn.as_str(), "tel:+12065551212");
    }

    #[tokio::test]
    async fn test_invalid_explicit_urn_falls_back_to_preferred() {
        let contact = Contact {
            id: ContactId(1),
            uuid: Uuid::new_v4(),
            name: "Cathy".into(),
            language: None,
            urns: vec![urn("twitter:invalid-urn"), urn("tel:+12065551111")],
        };
        let recipient = Recipient {
            contact_id: ContactId(1),
            urn: Some(urn("tel:1")),
        };
        assert_eq!(choose_urn(&recipient, &contact).unwrap().as_str(), "tel:+12065551111");
    }

    struct FailingWriter;

    #[async_trait]
    impl MessageWriter for FailingWriter {
        async fn write_messages(&self, _msgs: &[OutgoingMsg]) -> Result<usize, AppError> {
            Err(AppError::Internal("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_writer_failure_fails_batch() {
        let store = Arc::new(MemoryStore::new());
        let bob = store.add_contact(ORG, "Bob", None, vec![urn("tel:+12065552222")]);

        let sender = BatchSender::new(store.clone(), Arc::new(FailingWriter));
        let err = sender.send(&batch(vec![to(bob)])).await.unwrap_err();
        assert!(matches!(err, SendError::Store(AppError::Internal(_))));
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let sender = BatchSender::new(store.clone(), Arc::new(FailingWriter));
        assert_eq!(sender.send(&batch(vec![])).await.unwrap(), 0);
    }
}
