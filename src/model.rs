use serde::{Deserialize, Serialize};

/// Coarse classification of a raw webhook event, stored alongside the payload
/// and used by the worker to dispatch projections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Template,
    User,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "MESSAGE",
            EventKind::Template => "TEMPLATE",
            EventKind::User => "USER",
            EventKind::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MESSAGE" => Some(EventKind::Message),
            "TEMPLATE" => Some(EventKind::Template),
            "USER" => Some(EventKind::User),
            "UNKNOWN" => Some(EventKind::Unknown),
            _ => None,
        }
    }
}

/// Delivery-receipt status as emitted by the provider for a single message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageStatus {
    Accepted,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Accepted => "accepted",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    /// Case-insensitive provider token mapping. `error` and `undelivered`
    /// collapse into `failed`.
    pub fn parse_token(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accepted" => Some(MessageStatus::Accepted),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" | "error" | "undelivered" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// The recipient status this receipt upgrades towards.
    pub fn target_status(&self) -> RecipientStatus {
        match self {
            MessageStatus::Accepted => RecipientStatus::Submitted,
            MessageStatus::Sent => RecipientStatus::Sent,
            MessageStatus::Delivered => RecipientStatus::Delivered,
            MessageStatus::Read => RecipientStatus::Read,
            MessageStatus::Failed => RecipientStatus::Failed,
        }
    }
}

/// Campaign recipient delivery state. Ordered by `rank`; projections only
/// ever move a recipient to a higher rank (FAILED supersedes anything below
/// READ).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecipientStatus {
    Pending,
    Skipped,
    Submitted,
    Sent,
    Delivered,
    Read,
    Failed,
    Retrying,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "PENDING",
            RecipientStatus::Skipped => "SKIPPED",
            RecipientStatus::Submitted => "SUBMITTED",
            RecipientStatus::Sent => "SENT",
            RecipientStatus::Delivered => "DELIVERED",
            RecipientStatus::Read => "READ",
            RecipientStatus::Failed => "FAILED",
            RecipientStatus::Retrying => "RETRYING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RecipientStatus::Pending),
            "SKIPPED" => Some(RecipientStatus::Skipped),
            "SUBMITTED" => Some(RecipientStatus::Submitted),
            "SENT" => Some(RecipientStatus::Sent),
            "DELIVERED" => Some(RecipientStatus::Delivered),
            "READ" => Some(RecipientStatus::Read),
            "FAILED" => Some(RecipientStatus::Failed),
            "RETRYING" => Some(RecipientStatus::Retrying),
            _ => None,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            RecipientStatus::Pending | RecipientStatus::Skipped => 0,
            RecipientStatus::Submitted | RecipientStatus::Retrying => 1,
            RecipientStatus::Sent => 2,
            RecipientStatus::Delivered => 3,
            RecipientStatus::Read => 4,
            RecipientStatus::Failed => 5,
        }
    }
}

/// Template review status on the provider side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TemplateStatus {
    Draft,
    Submitted,
    Pending,
    Approved,
    Rejected,
}

impl TemplateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Draft => "DRAFT",
            TemplateStatus::Submitted => "SUBMITTED",
            TemplateStatus::Pending => "PENDING",
            TemplateStatus::Approved => "APPROVED",
            TemplateStatus::Rejected => "REJECTED",
        }
    }

    /// Case-insensitive provider token mapping. `IN_REVIEW` is treated as
    /// `SUBMITTED`; `DRAFT` never arrives over the wire.
    pub fn parse_token(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVED" => Some(TemplateStatus::Approved),
            "REJECTED" => Some(TemplateStatus::Rejected),
            "PENDING" => Some(TemplateStatus::Pending),
            "SUBMITTED" | "IN_REVIEW" => Some(TemplateStatus::Submitted),
            _ => None,
        }
    }
}

/// Consent-ish signal extracted from a user event. `Blocked` is mapped to an
/// opt-out (or dropped) depending on configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsentSignal {
    OptIn,
    OptOut,
    Blocked,
}

impl ConsentSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentSignal::OptIn => "OPT_IN",
            ConsentSignal::OptOut => "OPT_OUT",
            ConsentSignal::Blocked => "BLOCKED",
        }
    }

    /// Case-insensitive token mapping; `-` is treated as `_` so provider
    /// spellings like `opt-in` resolve.
    pub fn parse_token(s: &str) -> Option<Self> {
        let token = s.trim().to_ascii_uppercase().replace('-', "_");
        match token.as_str() {
            "OPT_IN" | "SUBSCRIBE" | "CONSENT_GRANTED" => Some(ConsentSignal::OptIn),
            "OPT_OUT" | "UNSUBSCRIBE" | "CONSENT_REVOKED" => Some(ConsentSignal::OptOut),
            "BLOCKED" | "BLOCK" | "USER_BLOCKED" => Some(ConsentSignal::Blocked),
            _ => None,
        }
    }
}

/// Row type for the append-only consent event table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsentEventType {
    OptIn,
    OptOut,
}

impl ConsentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentEventType::OptIn => "OPT_IN",
            ConsentEventType::OptOut => "OPT_OUT",
        }
    }
}

/// Aggregate consent stance per (user, company).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsentStatus {
    Unknown,
    OptIn,
    OptOut,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Unknown => "UNKNOWN",
            ConsentStatus::OptIn => "OPT_IN",
            ConsentStatus::OptOut => "OPT_OUT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tokens_collapse_failures() {
        assert_eq!(MessageStatus::parse_token("Error"), Some(MessageStatus::Failed));
        assert_eq!(MessageStatus::parse_token("UNDELIVERED"), Some(MessageStatus::Failed));
        assert_eq!(MessageStatus::parse_token(" read "), Some(MessageStatus::Read));
        assert_eq!(MessageStatus::parse_token("enqueued"), None);
    }

    #[test]
    fn recipient_ranks() {
        assert_eq!(RecipientStatus::Pending.rank(), 0);
        assert_eq!(RecipientStatus::Skipped.rank(), 0);
        assert_eq!(RecipientStatus::Retrying.rank(), 1);
        assert!(RecipientStatus::Failed.rank() > RecipientStatus::Read.rank());
    }

    #[test]
    fn template_tokens() {
        assert_eq!(TemplateStatus::parse_token("approved"), Some(TemplateStatus::Approved));
        assert_eq!(TemplateStatus::parse_token("IN_REVIEW"), Some(TemplateStatus::Submitted));
        assert_eq!(TemplateStatus::parse_token("paused"), None);
    }

    #[test]
    fn consent_tokens() {
        assert_eq!(ConsentSignal::parse_token("opt-in"), Some(ConsentSignal::OptIn));
        assert_eq!(ConsentSignal::parse_token("UNSUBSCRIBE"), Some(ConsentSignal::OptOut));
        assert_eq!(ConsentSignal::parse_token("user_blocked"), Some(ConsentSignal::Blocked));
        assert_eq!(ConsentSignal::parse_token("muted"), None);
    }

    #[test]
    fn kind_round_trip() {
        for kind in [
            EventKind::Message,
            EventKind::Template,
            EventKind::User,
            EventKind::Unknown,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
    }
}
