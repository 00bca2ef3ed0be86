//! Bearer credential supply.
//!
//! Authentication itself happens elsewhere; the session only reads whatever
//! token the provider currently holds.

use std::sync::{Arc, PoisonError, RwLock};

/// Supplies the bearer token for stream and REST access.
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` when signed out.
    fn bearer_token(&self) -> Option<String>;
}

/// In-memory token that can be replaced at runtime (re-authentication).
///
/// Cloning shares the same slot.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    /// Empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot pre-filled with `token`. Blank tokens count as absent.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        let shared = Self::new();
        shared.set(token);
        shared
    }

    /// Replace the token.
    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        let token = (!token.trim().is_empty()).then_some(token);
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Forget the token (sign-out).
    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl TokenProvider for SharedToken {
    fn bearer_token(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Fixed token, mostly for tests and the CLI.
impl TokenProvider for Option<String> {
    fn bearer_token(&self) -> Option<String> {
        self.clone().filter(|t| !t.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_token_set_and_clear() {
        let token = SharedToken::new();
        assert_eq!(token.bearer_token(), None);

        let view = token.clone();
        token.set("abc");
        assert_eq!(view.bearer_token().as_deref(), Some("abc"));

        token.clear();
        assert_eq!(view.bearer_token(), None);
    }

    #[test]
    fn test_blank_token_is_absent() {
        assert_eq!(SharedToken::with_token("   ").bearer_token(), None);
        assert_eq!(Some(String::new()).bearer_token(), None);
        assert_eq!(None::<String>.bearer_token(), None);
        assert_eq!(Some("t".to_string()).bearer_token().as_deref(), Some("t"));
    }
}
