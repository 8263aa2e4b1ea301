//! Per-operation context: cancellation, deadline, and caller identity.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{Result, SnapshotError};

/// Failure to determine the caller's group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The caller is not authenticated. Treated as the empty group.
    #[error("anonymous user")]
    Anonymous,

    #[error("authentication failed: {0}")]
    Failed(String),
}

/// Resolves the group that namespaces cheaply derived cache keys.
pub trait GroupResolver: Send + Sync {
    fn group_id(&self) -> std::result::Result<String, AuthError>;
}

/// A fixed group, e.g. from configuration.
#[derive(Debug, Clone)]
pub struct StaticGroup(pub String);

impl GroupResolver for StaticGroup {
    fn group_id(&self) -> std::result::Result<String, AuthError> {
        if self.0.is_empty() {
            Err(AuthError::Anonymous)
        } else {
            Ok(self.0.clone())
        }
    }
}

/// Cancellation flag shared between a context and whoever may cancel it.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Passed to every loader operation. Checked once per artifact and once per
/// chunk; work already done is not rolled back.
#[derive(Clone, Default)]
pub struct OpContext {
    cancel: CancelHandle,
    deadline: Option<Instant>,
    group: Option<Arc<dyn GroupResolver>>,
}

impl OpContext {
    /// Anonymous context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_group(mut self, resolver: Arc<dyn GroupResolver>) -> Self {
        self.group = Some(resolver);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fails if the operation was cancelled or its deadline passed.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(SnapshotError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Caller's group id; anonymous callers get the empty string.
    pub fn group_id(&self) -> Result<String> {
        let Some(resolver) = &self.group else {
            return Ok(String::new());
        };
        match resolver.group_id() {
            Ok(gid) => Ok(gid),
            Err(AuthError::Anonymous) => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("has_group", &self.group.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingResolver;

    impl GroupResolver for FailingResolver {
        fn group_id(&self) -> std::result::Result<String, AuthError> {
            Err(AuthError::Failed("expired token".into()))
        }
    }

    #[test]
    fn test_cancel() {
        let ctx = OpContext::new();
        assert!(ctx.check().is_ok());
        let handle = ctx.cancel_handle();
        let clone = ctx.clone();
        handle.cancel();
        assert!(matches!(ctx.check(), Err(SnapshotError::Cancelled)));
        assert!(matches!(clone.check(), Err(SnapshotError::Cancelled)));
    }

    #[test]
    fn test_deadline() {
        let past = OpContext::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(past.check(), Err(SnapshotError::DeadlineExceeded)));
        let future = OpContext::new().with_timeout(Duration::from_secs(3600));
        assert!(future.check().is_ok());
    }

    #[test]
    fn test_group_resolution() {
        assert_eq!(OpContext::new().group_id().unwrap(), "");
        let ctx = OpContext::new().with_group(Arc::new(StaticGroup("GR1".into())));
        assert_eq!(ctx.group_id().unwrap(), "GR1");
        let anon = OpContext::new().with_group(Arc::new(StaticGroup(String::new())));
        assert_eq!(anon.group_id().unwrap(), "");
        let failing = OpContext::new().with_group(Arc::new(FailingResolver));
        assert!(matches!(failing.group_id(), Err(SnapshotError::Auth(_))));
    }
}
