use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ModelError;

/// Opaque, unguessable token a worker presents when reporting a result.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    /// Random v4 token. Sequential ids would let a worker guess its
    /// neighbour's lease.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated identity of a worker, resolved by the transport layer.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ModelError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelError::InvalidWorker(
                "worker id must not be blank".into(),
            ));
        }
        if trimmed.len() == raw.len() {
            Ok(Self(raw))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease metadata handed out together with a job.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LeaseGrant {
    pub token: LeaseToken,
    pub owner: WorkerId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseGrant {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn duration(&self) -> chrono::Duration {
        self.expires_at - self.issued_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_is_trimmed_and_non_blank() {
        assert_eq!(WorkerId::new(" scanner-7 ").unwrap().as_str(), "scanner-7");
        assert!(WorkerId::new("   ").is_err());
    }

    #[test]
    fn tokens_are_not_sequential() {
        let a = LeaseToken::random();
        let b = LeaseToken::random();
        assert_ne!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn grant_expiry_is_inclusive() {
        let issued_at = Utc::now();
        let grant = LeaseGrant {
            token: LeaseToken::random(),
            owner: WorkerId::new("a").unwrap(),
            issued_at,
            expires_at: issued_at + chrono::Duration::seconds(60),
        };
        assert!(!grant.is_expired_at(issued_at));
        assert!(grant.is_expired_at(grant.expires_at));
        assert_eq!(grant.duration().num_seconds(), 60);
    }
}
