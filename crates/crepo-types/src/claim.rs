use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Length sentinel for a content claim that is still being written.
pub const UNKNOWN_LENGTH: i64 = -1;

struct ResourceClaimInner {
    container: String,
    section: String,
    id: String,
    loss_tolerant: bool,
}

/// Identity of one physical file in the repository.
///
/// Equality and hashing use `(container, section, id)` only, so a claim
/// rebuilt from a directory scan compares equal to the one handed out by
/// `create()`. Cloning is cheap (reference counted).
#[derive(Clone)]
pub struct ResourceClaim {
    inner: Arc<ResourceClaimInner>,
}

impl ResourceClaim {
    pub fn new(
        container: impl Into<String>,
        section: impl Into<String>,
        id: impl Into<String>,
        loss_tolerant: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ResourceClaimInner {
                container: container.into(),
                section: section.into(),
                id: id.into(),
                loss_tolerant,
            }),
        }
    }

    pub fn container(&self) -> &str {
        &self.inner.container
    }

    pub fn section(&self) -> &str {
        &self.inner.section
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Data loss on this claim is acceptable (e.g. non-critical buffering).
    pub fn is_loss_tolerant(&self) -> bool {
        self.inner.loss_tolerant
    }

    fn key(&self) -> (&str, &str, &str) {
        (self.container(), self.section(), self.id())
    }
}

impl PartialEq for ResourceClaim {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.key() == other.key()
    }
}

impl Eq for ResourceClaim {}

impl Hash for ResourceClaim {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for ResourceClaim {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceClaim {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Debug for ResourceClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceClaim")
            .field("container", &self.container())
            .field("section", &self.section())
            .field("id", &self.id())
            .field("loss_tolerant", &self.is_loss_tolerant())
            .finish()
    }
}

impl fmt::Display for ResourceClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResourceClaim[id={}, container={}, section={}]",
            self.id(),
            self.container(),
            self.section()
        )
    }
}

/// A logical `(offset, length)` window into a [`ResourceClaim`].
///
/// The length lives in a shared cell: clones of a content claim observe the
/// same length, which lets a reader opened before the writer finishes keep
/// following the claim as it grows. A length of [`UNKNOWN_LENGTH`] means the
/// claim is still being written.
#[derive(Clone)]
pub struct ContentClaim {
    resource: ResourceClaim,
    offset: u64,
    length: Arc<AtomicI64>,
}

impl ContentClaim {
    /// A claim that has not been written yet.
    pub fn new(resource: ResourceClaim, offset: u64) -> Self {
        Self {
            resource,
            offset,
            length: Arc::new(AtomicI64::new(UNKNOWN_LENGTH)),
        }
    }

    /// A claim with a known, final length (e.g. rebuilt from metadata).
    pub fn with_length(resource: ResourceClaim, offset: u64, length: u64) -> Self {
        Self {
            resource,
            offset,
            length: Arc::new(AtomicI64::new(length as i64)),
        }
    }

    pub fn resource_claim(&self) -> &ResourceClaim {
        &self.resource
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Current length, or `None` while it is still unknown.
    pub fn length(&self) -> Option<u64> {
        let raw = self.length.load(Ordering::Acquire);
        (raw >= 0).then_some(raw as u64)
    }

    /// Raw length including the [`UNKNOWN_LENGTH`] sentinel.
    pub fn raw_length(&self) -> i64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn set_length(&self, length: u64) {
        self.length.store(length as i64, Ordering::Release);
    }

    /// Supplier that always reports the latest length of this claim.
    pub fn length_supplier(&self) -> impl Fn() -> Option<u64> + Send + Sync + 'static {
        let cell = Arc::clone(&self.length);
        move || {
            let raw = cell.load(Ordering::Acquire);
            (raw >= 0).then_some(raw as u64)
        }
    }

    /// Plain-data description of this claim.
    pub fn coordinates(&self) -> ClaimCoordinates {
        ClaimCoordinates {
            container: self.resource.container().to_string(),
            section: self.resource.section().to_string(),
            id: self.resource.id().to_string(),
            offset: self.offset,
            length: self.raw_length(),
        }
    }
}

impl PartialEq for ContentClaim {
    fn eq(&self, other: &Self) -> bool {
        self.resource == other.resource && self.offset == other.offset
    }
}

impl Eq for ContentClaim {}

impl Hash for ContentClaim {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resource.hash(state);
        self.offset.hash(state);
    }
}

impl fmt::Debug for ContentClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentClaim")
            .field("resource", &self.resource)
            .field("offset", &self.offset)
            .field("length", &self.raw_length())
            .finish()
    }
}

impl fmt::Display for ContentClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ContentClaim[{}, offset={}, length={}]",
            self.resource,
            self.offset,
            self.raw_length()
        )
    }
}

/// Serializable coordinates of a content claim, for tooling and logs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCoordinates {
    pub container: String,
    pub section: String,
    pub id: String,
    pub offset: u64,
    pub length: i64,
}

impl ClaimCoordinates {
    /// Rebuild a content claim. The resource claim is never loss tolerant.
    pub fn to_content_claim(&self) -> Result<ContentClaim, TypeError> {
        if self.container.is_empty() || self.section.is_empty() {
            return Err(TypeError::InvalidCoordinates(
                "container and section must be non-empty".into(),
            ));
        }
        if self.id.is_empty() || self.id.contains(['/', '\\']) {
            return Err(TypeError::InvalidClaimId(self.id.clone()));
        }
        let resource = ResourceClaim::new(&*self.container, &*self.section, &*self.id, false);
        Ok(if self.length >= 0 {
            ContentClaim::with_length(resource, self.offset, self.length as u64)
        } else {
            ContentClaim::new(resource, self.offset)
        })
    }
}

/// An open, still-appendable resource claim and the offset where the next
/// content claim will start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimLengthPair {
    pub claim: ResourceClaim,
    pub length: u64,
}

impl ClaimLengthPair {
    pub fn new(claim: ResourceClaim, length: u64) -> Self {
        Self { claim, length }
    }
}
