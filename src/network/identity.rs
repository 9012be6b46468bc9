//! Player Identity
//!
//! Two IDs per install: a stable leaderboard ID and a per-process session ID
//! used for matches and the queue. Players are ephemeral; nothing here
//! authenticates.

use sha2::{Digest, Sha256};

use crate::game::state::PlayerId;

/// Stable and session identity of the local player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaIdentity {
    stable: PlayerId,
    session: PlayerId,
}

impl ArenaIdentity {
    /// Random identity.
    pub fn generate() -> Self {
        let bytes = *uuid::Uuid::new_v4().as_bytes();
        Self::with_stable(PlayerId(format!("p-{}", hex::encode(&bytes[..6]))))
    }

    /// Identity whose stable ID is derived from an install secret.
    pub fn from_install_secret(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"sudoku-arena-player:");
        hasher.update(secret.as_bytes());
        let hash = hasher.finalize();
        Self::with_stable(PlayerId(format!("p-{}", hex::encode(&hash[..6]))))
    }

    /// Identity with a fresh session ID on top of `stable`.
    pub fn with_stable(stable: PlayerId) -> Self {
        let bytes = *uuid::Uuid::new_v4().as_bytes();
        let session = PlayerId(format!("{}-s{}", stable.0, hex::encode(&bytes[..4])));
        Self { stable, session }
    }

    /// Leaderboard ID; survives restarts.
    pub fn stable_id(&self) -> &PlayerId {
        &self.stable
    }

    /// Match and queue ID for this process.
    pub fn session_id(&self) -> &PlayerId {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_id_shape() {
        let identity = ArenaIdentity::generate();
        let stable = identity.stable_id().as_str();
        assert!(stable.starts_with("p-"));
        assert_eq!(stable.len(), 14);
        assert!(stable[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_id_extends_stable() {
        let identity = ArenaIdentity::from_install_secret("install-1");
        let session = identity.session_id().as_str();
        assert!(session.starts_with(&format!("{}-s", identity.stable_id())));
        assert_eq!(session.len(), 14 + 2 + 8);
    }

    #[test]
    fn test_install_secret_is_deterministic() {
        let a = ArenaIdentity::from_install_secret("install-1");
        let b = ArenaIdentity::from_install_secret("install-1");
        let c = ArenaIdentity::from_install_secret("install-2");
        assert_eq!(a.stable_id(), b.stable_id());
        assert_ne!(a.session_id(), b.session_id());
        assert_ne!(a.stable_id(), c.stable_id());
    }
}
