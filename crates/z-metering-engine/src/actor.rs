//! Caller identities.
//!
//! Every engine operation names who is asking. Users may only touch their own
//! records; internal feature call sites act on behalf of any user.

use std::fmt;

use z_metering_core::{MeteringError, Result, UserId};

/// The authenticated caller of an engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// An end user acting on their own behalf.
    User(UserId),

    /// A trusted internal service, identified by name.
    Service(String),
}

impl Actor {
    /// Check that this caller may read or mutate `user_id`'s records.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::Forbidden` when a user targets someone else.
    pub fn authorize(&self, user_id: &UserId) -> Result<()> {
        match self {
            Self::Service(_) => Ok(()),
            Self::User(own) if own == user_id => Ok(()),
            Self::User(_) => Err(MeteringError::Forbidden {
                user_id: user_id.to_string(),
            }),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Service(name) => write!(f, "service:{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn users_are_confined_to_their_own_records() {
        let alice = UserId::generate();
        let bob = UserId::generate();

        assert!(Actor::User(alice).authorize(&alice).is_ok());
        assert!(matches!(
            Actor::User(alice).authorize(&bob),
            Err(MeteringError::Forbidden { .. })
        ));
        assert!(Actor::Service("chat".into()).authorize(&bob).is_ok());
    }
}
