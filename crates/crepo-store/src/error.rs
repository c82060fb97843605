use crepo_types::ResourceClaim;

/// Errors from content repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The claim's bytes exist in neither the live nor the archive location,
    /// or the resource claim is shorter than the content claim's offset.
    /// Callers should treat this as permanent data loss for the claim.
    #[error("content not found for {claim}: {reason}")]
    ContentNotFound { claim: ResourceClaim, reason: String },

    /// I/O error from the underlying file system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid repository configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A container could not be emptied or is not writable afterwards.
    #[error("repository purge failed: {0}")]
    Purge(String),

    /// The caller used a claim in a way the repository does not allow.
    #[error("invalid claim: {0}")]
    InvalidClaim(String),

    /// No container with this name is configured.
    #[error("unknown container: {0}")]
    UnknownContainer(String),

    /// The repository has been shut down and accepts no new claims.
    #[error("content repository is shut down")]
    Shutdown,
}

impl StoreError {
    pub(crate) fn not_found(claim: &ResourceClaim, reason: impl Into<String>) -> Self {
        Self::ContentNotFound {
            claim: claim.clone(),
            reason: reason.into(),
        }
    }

    /// `true` for the data-loss class of errors.
    pub fn is_content_not_found(&self) -> bool {
        matches!(self, Self::ContentNotFound { .. })
    }
}

/// Result alias for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;
