//! Leases and acquisition outcomes
//!
//! A [`Lease`] is the only handle through which permits flow back to a
//! limiter. Every limiter hands out the same lease type, so callers holding a
//! lease do not care which admission design produced it.

use std::fmt;
use std::sync::Arc;

use strata_errors::LimiterError;

/// Implemented by limiter cores that can take permits back
pub(crate) trait PermitRelease: Send + Sync {
    fn release_permits(self: Arc<Self>, permits: usize);
}

/// Permits granted by a limiter
///
/// Dropping the lease returns its permits. [`Lease::release`] does the same
/// eagerly and may be called any number of times; only the first call has an
/// effect.
#[must_use = "dropping a lease releases its permits immediately"]
pub struct Lease {
    acquired: bool,
    permits: usize,
    owner: Option<Arc<dyn PermitRelease>>,
}

impl Lease {
    pub(crate) fn granted(permits: usize, owner: Arc<dyn PermitRelease>) -> Self {
        Self {
            acquired: true,
            permits,
            owner: Some(owner),
        }
    }

    /// A granted lease that holds nothing, used for zero-permit probes
    pub(crate) fn empty() -> Self {
        Self {
            acquired: true,
            permits: 0,
            owner: None,
        }
    }

    /// A lease that was never acquired
    pub fn rejected() -> Self {
        Self {
            acquired: false,
            permits: 0,
            owner: None,
        }
    }

    /// Whether permits were granted
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Number of permits this lease held when granted
    #[must_use]
    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Whether the permits are still held
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.owner.is_some()
    }

    /// Return the permits to the limiter
    pub fn release(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release_permits(self.permits);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("acquired", &self.acquired)
            .field("permits", &self.permits)
            .field("held", &self.owner.is_some())
            .finish()
    }
}

/// Outcome of an acquisition attempt
///
/// Backpressure, deadlines, cancellation and teardown are all ordinary
/// outcomes. Only malformed arguments are reported as errors.
#[must_use]
#[derive(Debug)]
pub enum Acquisition {
    /// Permits were granted
    Acquired(Lease),
    /// A bounded wait queue was full; shed load or retry later
    Rejected,
    /// The deadline elapsed before a permit became free
    TimedOut,
    /// The caller's cancellation signal fired
    Canceled,
    /// The limiter has been torn down
    Disposed,
}

impl Acquisition {
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// Borrow the lease if one was granted
    #[must_use]
    pub fn lease(&self) -> Option<&Lease> {
        match self {
            Self::Acquired(lease) => Some(lease),
            _ => None,
        }
    }

    /// The granted lease, or a non-acquired lease for every other outcome
    pub fn into_lease(self) -> Lease {
        match self {
            Self::Acquired(lease) => lease,
            _ => Lease::rejected(),
        }
    }

    /// Convert into a `Result` for callers that propagate with `?`
    ///
    /// # Errors
    ///
    /// Returns the matching [`LimiterError`] for every outcome other than
    /// [`Acquisition::Acquired`].
    pub fn into_result(self, resource: impl fmt::Display) -> Result<Lease, LimiterError> {
        match self {
            Self::Acquired(lease) => Ok(lease),
            Self::Rejected => Err(LimiterError::Rejected {
                resource: resource.to_string(),
            }),
            Self::TimedOut => Err(LimiterError::TimedOut),
            Self::Canceled => Err(LimiterError::Canceled),
            Self::Disposed => Err(LimiterError::Disposed),
        }
    }
}
