use std::{fmt, time::Duration};

use mainframe_model::{LeaseToken, WorkerId};

use crate::error::Result;

/// Produces the opaque token identifying a new lease.
pub trait LeaseTokenGenerator: Send + Sync + fmt::Debug {
    fn next_token(&self) -> LeaseToken;
}

/// Random UUID v4 tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomLeaseTokens;

impl LeaseTokenGenerator for RandomLeaseTokens {
    fn next_token(&self) -> LeaseToken {
        LeaseToken::random()
    }
}

/// A worker asking for work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRequest {
    pub worker: WorkerId,
    /// Requested lease length; the class default applies when unset.
    pub lease_duration: Option<Duration>,
    /// Named job class selecting its own lease bounds.
    pub job_class: Option<String>,
}

impl JobRequest {
    /// Validates the worker identity resolved by the transport.
    pub fn new(worker: impl Into<String>) -> Result<Self> {
        Ok(Self {
            worker: WorkerId::new(worker)?,
            lease_duration: None,
            job_class: None,
        })
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = Some(duration);
        self
    }

    pub fn with_job_class(mut self, class: impl Into<String>) -> Self {
        self.job_class = Some(class.into());
        self
    }
}
