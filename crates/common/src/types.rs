use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Identifier of an organization (tenant). Doubles as the task queue owner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct OrgId(pub i64);

/// Identifier of a contact within an organization.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ContactId(pub i64);

/// Identifier of a contact group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct GroupId(pub i64);

/// Identifier of a persisted broadcast, when the request came from one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct BroadcastId(pub i64);

macro_rules! impl_id_display {
    ($($ty:ty),*) => {
        $(
            impl std::fmt::Display for $ty {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

impl_id_display!(OrgId, ContactId, GroupId, BroadcastId);

/// ISO 639-3 language code (e.g. `eng`, `fra`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Language(String);

impl Language {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// URN schemes we know how to deliver to.
const TEL_SCHEME: &str = "tel";
const MAILTO_SCHEME: &str = "mailto";
const TWITTER_SCHEME: &str = "twitter";
const TELEGRAM_SCHEME: &str = "telegram";
const WHATSAPP_SCHEME: &str = "whatsapp";
const EXTERNAL_SCHEME: &str = "ext";

/// A contact address in `scheme:path` form, e.g. `tel:+250788123123`.
///
/// Parsing only checks the structure. Whether the address can actually be
/// delivered to is a separate question answered by [`Urn::is_valid`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn {
    raw: String,
    split: usize,
}

impl Urn {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let raw = raw.trim();
        let split = raw
            .find(':')
            .ok_or_else(|| AppError::Validation(format!("URN '{}' has no scheme", raw)))?;

        if split == 0 || split == raw.len() - 1 {
            return Err(AppError::Validation(format!(
                "URN '{}' must have a scheme and a path",
                raw
            )));
        }

        Ok(Self {
            raw: format!("{}:{}", raw[..split].to_ascii_lowercase(), &raw[split + 1..]),
            split,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn path(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a message can be sent to this address.
    pub fn is_valid(&self) -> bool {
        let path = self.path();
        match self.scheme() {
            TEL_SCHEME => {
                let digits = path.strip_prefix('+').unwrap_or(path);
                (5..=16).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
            }
            MAILTO_SCHEME => match path.split_once('@') {
                Some((user, domain)) => !user.is_empty() && domain.contains('.'),
                None => false,
            },
            TWITTER_SCHEME => {
                (1..=15).contains(&path.len())
                    && path.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            TELEGRAM_SCHEME | WHATSAPP_SCHEME => path.chars().all(|c| c.is_ascii_digit()),
            EXTERNAL_SCHEME => !path.chars().any(char::is_whitespace),
            _ => false,
        }
    }
}

impl TryFrom<String> for Urn {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Urn::parse(&value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.raw
    }
}

impl std::str::FromStr for Urn {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Urn::parse(s)
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A contact together with its addresses, ordered by priority (highest first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub uuid: Uuid,
    pub name: String,
    pub language: Option<Language>,
    pub urns: Vec<Urn>,
}

impl Contact {
    /// The highest priority address we can actually deliver to.
    pub fn preferred_urn(&self) -> Option<&Urn> {
        self.urns.iter().find(|urn| urn.is_valid())
    }

    pub fn has_urn(&self, urn: &Urn) -> bool {
        self.urns.iter().any(|u| u == urn)
    }

    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

/// A rendered message ready to be persisted and queued for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMsg {
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub urn: Urn,
    pub broadcast_id: Option<BroadcastId>,
    pub text: String,
    pub attachments: Vec<String>,
    pub quick_replies: Vec<String>,
    pub created_on: DateTime<Utc>,
}
