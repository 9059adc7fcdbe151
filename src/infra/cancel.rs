//! Linked cancellation for one pipeline generation
//!
//! A generation stops when the service stops or when the configuration file
//! changes. `GenerationTokens::linked` is cancelled on either.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct GenerationTokens {
    /// Cancelled by the configuration watcher
    pub config_changed: CancellationToken,
    /// Cancelled when the service stops or the configuration changes
    pub linked: CancellationToken,
}

impl GenerationTokens {
    /// Derive a fresh generation from the service token.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(service: &CancellationToken) -> Self {
        let config_changed = CancellationToken::new();
        let linked = link(service, &config_changed);
        Self { config_changed, linked }
    }

    pub fn is_config_change(&self) -> bool {
        self.config_changed.is_cancelled()
    }
}

/// A token cancelled as soon as either parent is.
///
/// `parent` cancellation propagates through the child token tree, `other` via
/// a forwarding task that ends with the returned token.
pub fn link(parent: &CancellationToken, other: &CancellationToken) -> CancellationToken {
    let linked = parent.child_token();
    if other.is_cancelled() {
        linked.cancel();
        return linked;
    }

    let other = other.clone();
    let forward = linked.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = other.cancelled() => forward.cancel(),
            _ = forward.cancelled() => {}
        }
    });
    linked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_parent_cancels_linked() {
        let service = CancellationToken::new();
        let tokens = GenerationTokens::new(&service);
        service.cancel();
        timeout(Duration::from_secs(1), tokens.linked.cancelled()).await.unwrap();
        assert!(!tokens.is_config_change());
    }

    #[tokio::test]
    async fn test_config_change_cancels_linked_only() {
        let service = CancellationToken::new();
        let tokens = GenerationTokens::new(&service);
        tokens.config_changed.cancel();
        timeout(Duration::from_secs(1), tokens.linked.cancelled()).await.unwrap();
        assert!(tokens.is_config_change());
        assert!(!service.is_cancelled());
    }

    #[tokio::test]
    async fn test_link_already_cancelled() {
        let service = CancellationToken::new();
        let other = CancellationToken::new();
        other.cancel();
        assert!(link(&service, &other).is_cancelled());
    }

    #[tokio::test]
    async fn test_generations_are_independent() {
        let service = CancellationToken::new();
        let first = GenerationTokens::new(&service);
        first.config_changed.cancel();
        let second = GenerationTokens::new(&service);
        tokio::task::yield_now().await;
        assert!(!second.linked.is_cancelled());
    }
}
