use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Failure reported by a CRM adapter. Only transient failures are retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("transient crm failure: {0}")]
    Transient(String),
    #[error("permanent crm failure: {0}")]
    Permanent(String),
}

impl WriteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Permanent(message) => message,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("stored record could not be decoded: {0}")]
    Decode(String),
    #[error("record not found: {0}")]
    NotFound(String),
    /// The record moved on since it was read, e.g. a stale claim was taken over.
    #[error("record changed concurrently: {0}")]
    Conflict(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AutomationError {
    #[error("receipt automation unavailable: {0}")]
    Unavailable(String),
    #[error("receipt automation rejected the request: {0}")]
    Rejected(String),
}

/// Error taxonomy for event reconciliation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("no tracked deal for {0}")]
    UntrackedEvent(String),
    #[error("permanent validation failure: {0}")]
    PermanentValidation(String),
    #[error("transient write failure: {0}")]
    TransientWrite(String),
    #[error("downstream automation failure: {0}")]
    DownstreamAutomation(String),
    #[error("retries exhausted for sync item {0}")]
    Escalation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientWrite(_) | Self::Store(StoreError::Backend(_)))
    }

    /// Stable label used as `error_class` in logs.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::UntrackedEvent(_) => "untracked_event",
            Self::PermanentValidation(_) => "permanent_validation",
            Self::TransientWrite(_) => "transient_write",
            Self::DownstreamAutomation(_) => "downstream_automation",
            Self::Escalation(_) => "escalation",
            Self::Store(_) => "store",
        }
    }
}

impl From<DomainError> for ReconcileError {
    fn from(value: DomainError) -> Self {
        Self::PermanentValidation(value.to_string())
    }
}

impl From<WriteError> for ReconcileError {
    fn from(value: WriteError) -> Self {
        match value {
            WriteError::Transient(message) => Self::TransientWrite(message),
            WriteError::Permanent(message) => Self::PermanentValidation(message),
        }
    }
}

impl From<AutomationError> for ReconcileError {
    fn from(value: AutomationError) -> Self {
        Self::DownstreamAutomation(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("authentication failure: {0}")]
    Authentication(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(message) => Self::NotFound(message),
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<ReconcileError> for ApplicationError {
    fn from(value: ReconcileError) -> Self {
        match value {
            ReconcileError::Authentication(message) => Self::Authentication(message),
            ReconcileError::UntrackedEvent(message) => Self::NotFound(message),
            ReconcileError::PermanentValidation(message) => {
                Self::Domain(DomainError::InvariantViolation(message))
            }
            ReconcileError::Store(error) => Self::from(error),
            other => Self::Integration(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("unauthorized: {message}")]
    Unauthorized { message: String, correlation_id: String },
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "The request could not be authenticated.",
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested record was not found.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Unauthorized { correlation_id, .. }
            | Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::Unauthorized { correlation_id: id, .. }
            | InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Domain(_) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: unassigned(),
            },
            ApplicationError::Authentication(message) => {
                Self::Unauthorized { message, correlation_id: unassigned() }
            }
            ApplicationError::NotFound(message) => {
                Self::NotFound { message, correlation_id: unassigned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}
