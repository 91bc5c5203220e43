//! Session bindings for the streamable HTTP transport
//!
//! A session id is a correlation handle for streaming and resumption, never
//! a credential. It is bound to the token subject the moment it is issued,
//! and every later request must still present a valid bearer token whose
//! subject matches the binding. A stolen id is useless without the
//! matching token.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;

use super::AuthError;

/// Concurrent map of session id to bound subject. First writer for an id
/// wins; a second attempt to bind the same id is a Conflict.
#[derive(Default)]
pub struct SessionStore {
    bindings: DashMap<String, String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an unpredictable session id from the thread-local CSPRNG
    pub fn generate_id() -> String {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 32] = rng.gen();
        hex::encode(bytes)
    }

    /// Issue a fresh session bound to `subject`
    pub fn issue(&self, subject: &str) -> Result<String, AuthError> {
        let id = Self::generate_id();
        self.bind(&id, subject)?;
        Ok(id)
    }

    /// Bind an id to a subject. The entry lock serializes racing first
    /// uses: the first writer wins and the loser gets a Conflict.
    pub fn bind(&self, id: &str, subject: &str) -> Result<(), AuthError> {
        match self.bindings.entry(id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(subject.to_string());
                Ok(())
            }
            Entry::Occupied(_) => Err(AuthError::SessionConflict),
        }
    }

    /// Check a presented session id against its binding. The id alone never
    /// grants access; the caller has already re-validated a bearer token and
    /// passes its subject here.
    pub fn validate(&self, id: &str, subject: &str) -> Result<(), AuthError> {
        match self.bindings.get(id) {
            None => Err(AuthError::UnknownSession),
            Some(bound) if bound.value() == subject => Ok(()),
            Some(_) => Err(AuthError::SessionMismatch),
        }
    }

    /// Tear down a session. Only the bound subject may terminate it.
    pub fn terminate(&self, id: &str, subject: &str) -> Result<(), AuthError> {
        self.validate(id, subject)?;
        self.bindings.remove(id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
