//! Per-recipient message rendering.
//!
//! Supports the `@contact.*` expressions a broadcast author can put in text,
//! attachments and quick replies. Anything we don't recognize is left as
//! written, and `@@` produces a literal `@`.

use postroom_common::types::{Contact, Urn};

/// Values available to expressions while rendering for one recipient.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub contact: &'a Contact,
    pub urn: &'a Urn,
}

impl<'a> RenderContext<'a> {
    pub fn new(contact: &'a Contact, urn: &'a Urn) -> Self {
        Self { contact, urn }
    }

    fn lookup(&self, expression: &str) -> Option<String> {
        let value = match expression.to_ascii_lowercase().as_str() {
            "contact" | "contact.name" => self.contact.name.clone(),
            "contact.first_name" => self.contact.first_name().to_string(),
            "contact.uuid" => self.contact.uuid.to_string(),
            "contact.language" => self
                .contact
                .language
                .as_ref()
                .map(|lang| lang.as_str().to_string())
                .unwrap_or_default(),
            "contact.urn" => self.urn.path().to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Render `template` for this recipient.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(at) = rest.find('@') {
            out.push_str(&rest[..at]);
            let after = &rest[at + 1..];

            if let Some(escaped) = after.strip_prefix('@') {
                out.push('@');
                rest = escaped;
                continue;
            }

            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                .unwrap_or(after.len());
            // a trailing dot ends the sentence, not the expression
            let expression = after[..len].trim_end_matches('.');

            match self.lookup(expression) {
                Some(value) => out.push_str(&value),
                None => {
                    out.push('@');
                    out.push_str(expression);
                }
            }
            rest = &after[expression.len()..];
        }

        out.push_str(rest);
        out
    }

    pub fn render_all(&self, templates: &[String]) -> Vec<String> {
        templates.iter().map(|t| self.render(t)).collect()
    }
}
