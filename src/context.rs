//! Authenticated session context.
//!
//! A [`SessionContext`] is the explicit value every stream reads its bearer
//! credential from. Logging out revokes the credential, which tears down the
//! push channel registered on the context. Dropping every clone of the
//! context has the same effect.

use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use tokio::sync::watch;

/// Cloneable handle to one authenticated session.
#[derive(Clone, Debug)]
pub struct SessionContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    credential: watch::Sender<Option<SecretString>>,
    push_channel: Mutex<Option<Arc<watch::Sender<bool>>>>,
}

impl SessionContext {
    /// Creates a context with no credential.
    pub fn new() -> Self {
        let (credential, _) = watch::channel(None);
        Self {
            inner: Arc::new(ContextInner {
                credential,
                push_channel: Mutex::new(None),
            }),
        }
    }

    /// Creates a context that is already authenticated.
    pub fn with_credential(credential: SecretString) -> Self {
        let context = Self::new();
        context.set_credential(credential);
        context
    }

    /// Stores a new credential. Later connection attempts use it.
    pub fn set_credential(&self, credential: SecretString) {
        self.inner.credential.send_replace(Some(credential));
    }

    /// Revokes the credential and tears down the push channel, if any.
    pub fn revoke(&self) {
        self.inner.credential.send_replace(None);
    }

    /// Returns the credential current at the time of the call.
    pub fn credential(&self) -> Option<SecretString> {
        self.inner.credential.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.credential.borrow().is_some()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<SecretString>> {
        self.inner.credential.subscribe()
    }

    /// Registers a push channel's teardown signal, tearing down the channel
    /// registered before it.
    pub(crate) fn replace_push_channel(&self, teardown: Arc<watch::Sender<bool>>) {
        let previous = match self.inner.push_channel.lock() {
            Ok(mut slot) => slot.replace(teardown),
            Err(poisoned) => poisoned.into_inner().replace(teardown),
        };
        if let Some(previous) = previous {
            previous.send_replace(true);
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::{ExposeSecret, SecretString};
    use tokio::sync::watch;

    use super::SessionContext;

    #[test]
    fn new_context_has_no_credential() {
        let context = SessionContext::new();
        assert!(!context.is_authenticated());
        assert!(context.credential().is_none());
    }

    #[test]
    fn clones_observe_credential_rotation_and_revocation() {
        let context = SessionContext::with_credential(SecretString::new("first".to_string()));
        let clone = context.clone();

        context.set_credential(SecretString::new("second".to_string()));
        let current = clone.credential().expect("credential");
        assert_eq!(current.expose_secret(), "second");

        clone.revoke();
        assert!(!context.is_authenticated());
    }

    #[test]
    fn replacing_push_channel_signals_previous_teardown() {
        let context = SessionContext::new();
        let (first_tx, first_rx) = watch::channel(false);
        let (second_tx, second_rx) = watch::channel(false);

        context.replace_push_channel(Arc::new(first_tx));
        assert!(!*first_rx.borrow());

        context.replace_push_channel(Arc::new(second_tx));
        assert!(*first_rx.borrow());
        assert!(!*second_rx.borrow());
    }
}
