//! Authenticated actor
//!
//! Sign-in itself happens elsewhere; this only holds who is acting and the
//! token used to talk to the remote.

use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub access_token: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            access_token: access_token.into(),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Shared, swappable handle to the current actor
#[derive(Clone, Default)]
pub struct Session {
    actor: Arc<RwLock<Option<Actor>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(actor: Actor) -> Self {
        let session = Self::new();
        session.sign_in(actor);
        session
    }

    pub fn sign_in(&self, actor: Actor) {
        tracing::info!("Actor signed in: {}", actor.id);
        *self.write() = Some(actor);
    }

    pub fn sign_out(&self) {
        if self.write().take().is_some() {
            tracing::info!("Actor signed out");
        }
    }

    pub fn actor(&self) -> Option<Actor> {
        match self.actor.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Actor>> {
        match self.actor.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_and_out() {
        let session = Session::new();
        assert!(session.actor().is_none());

        session.sign_in(Actor::new("user-1", "token"));
        assert_eq!(session.actor().unwrap().id, "user-1");

        let clone = session.clone();
        clone.sign_out();
        assert!(session.actor().is_none());
    }
}
