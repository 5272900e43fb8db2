use crate::error::ProviderError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Run-scoped cancellation flag. Cloned into every task of a pipeline
/// run and checked at suspension points: before outbound requests,
/// inside rate-limiter waits and between retry sleeps. Cache writes in
/// progress are deliberately not interrupted.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn ensure_live(&self) -> Result<(), ProviderError> {
        if self.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::cancel::CancellationToken;

    #[test]
    fn fresh_token_is_live() {
        let token = CancellationToken::new();

        assert!(!token.is_cancelled());
        assert!(token.ensure_live().is_ok());
    }

    #[test]
    fn cancellation_is_visible_through_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();

        token.cancel();

        assert!(clone.is_cancelled());
        assert!(clone.ensure_live().is_err());
    }
}
