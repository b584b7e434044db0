use thiserror::Error;

/// Pipeline error taxonomy.
///
/// Most call sites propagate `anyhow::Error`; these variants exist so that
/// the worker loop and the ledger's callers can branch on error kind
/// (duplicate vs. quota vs. validation) instead of matching on message text.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The ledger already holds a record for this guid.
    #[error("item {guid} is already recorded")]
    AlreadyExists { guid: String },

    /// One credential ran out of daily quota. Handled internally by the
    /// translator via rotation; callers normally only see the variant below.
    #[error("credential {0} has exhausted its daily quota")]
    QuotaExhausted(String),

    /// Every configured credential is exhausted for the current day.
    #[error("all translation credentials exhausted for today")]
    AllCredentialsExhausted,

    /// The translation backend returned an unusable response.
    #[error("translation failed: {0}")]
    Translation(String),

    /// The CMS rejected the request as invalid (4xx), e.g. a slug collision.
    #[error("CMS rejected request: {0}")]
    CmsValidation(String),

    /// An item is missing required fields and never enters the queue.
    #[error("item rejected: {0}")]
    Validation(String),
}

impl PipelineError {
    /// Whether this error means the translation credential pool is dry and
    /// the worker should pause instead of burning queue entries.
    pub fn is_credentials_exhausted(&self) -> bool {
        matches!(self, PipelineError::AllCredentialsExhausted)
    }
}

/// Check an `anyhow` error for credential-pool exhaustion.
///
/// Looks in two places: `anyhow::Error::downcast_ref`, which sees a
/// `PipelineError` attached as typed context, and the source chain, which
/// sees one wrapped as the root cause. A context-attached variant never
/// shows up in the chain as a bare `PipelineError`, so the chain walk alone
/// is not enough.
pub fn is_all_credentials_exhausted(err: &anyhow::Error) -> bool {
    if err
        .downcast_ref::<PipelineError>()
        .map(PipelineError::is_credentials_exhausted)
        .unwrap_or(false)
    {
        return true;
    }
    err.chain().any(|cause| {
        cause
            .downcast_ref::<PipelineError>()
            .map(PipelineError::is_credentials_exhausted)
            .unwrap_or(false)
    })
}
