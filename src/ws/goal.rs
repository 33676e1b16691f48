//! Goal and operation tags.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use super::error::ProtocolError;
use crate::core::constants::{
    GOAL_AUTH, GOAL_DATA, GOAL_PRESENCE, GOAL_STATUS, GOAL_SUBSCRIBE, GOAL_UNSUBSCRIBE,
    OPERATION_CREATE, OPERATION_DELETE, OPERATION_UPDATE,
};

/// Semantic type of a packet. Serialized as its numeric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Goal {
    /// Authenticate the socket session.
    Auth,
    /// Announce presence.
    Presence,
    /// Open a subscription.
    Subscribe,
    /// Close a subscription.
    Unsubscribe,
    /// Query connection status.
    Status,
    /// Server push for an established subscription.
    Data,
}

impl Goal {
    /// Numeric tag.
    pub fn tag(self) -> u8 {
        match self {
            Goal::Auth => GOAL_AUTH,
            Goal::Presence => GOAL_PRESENCE,
            Goal::Subscribe => GOAL_SUBSCRIBE,
            Goal::Unsubscribe => GOAL_UNSUBSCRIBE,
            Goal::Status => GOAL_STATUS,
            Goal::Data => GOAL_DATA,
        }
    }
}

impl TryFrom<u8> for Goal {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            GOAL_AUTH => Ok(Goal::Auth),
            GOAL_PRESENCE => Ok(Goal::Presence),
            GOAL_SUBSCRIBE => Ok(Goal::Subscribe),
            GOAL_UNSUBSCRIBE => Ok(Goal::Unsubscribe),
            GOAL_STATUS => Ok(Goal::Status),
            GOAL_DATA => Ok(Goal::Data),
            other => Err(ProtocolError::UnknownGoal(other)),
        }
    }
}

impl From<Goal> for u8 {
    fn from(goal: Goal) -> Self {
        goal.tag()
    }
}

/// One concrete change carried by a data push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Entity created.
    Create,
    /// Entity updated.
    Update,
    /// Entity deleted.
    Delete,
}

impl Operation {
    /// Numeric tag.
    pub fn tag(self) -> u8 {
        match self {
            Operation::Create => OPERATION_CREATE,
            Operation::Update => OPERATION_UPDATE,
            Operation::Delete => OPERATION_DELETE,
        }
    }

    /// Parse a concrete operation. Combined masks are rejected.
    pub fn from_tag(tag: u64) -> Result<Self, ProtocolError> {
        match u8::try_from(tag) {
            Ok(OPERATION_CREATE) => Ok(Operation::Create),
            Ok(OPERATION_UPDATE) => Ok(Operation::Update),
            Ok(OPERATION_DELETE) => Ok(Operation::Delete),
            _ => Err(ProtocolError::UnknownOperation(tag)),
        }
    }
}

/// Set of operations a subscription is interested in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationMask(u8);

impl OperationMask {
    /// Creations only.
    pub const CREATE: Self = Self(OPERATION_CREATE);
    /// Updates only.
    pub const UPDATE: Self = Self(OPERATION_UPDATE);
    /// Deletions only.
    pub const DELETE: Self = Self(OPERATION_DELETE);
    /// Creations and updates.
    pub const CREATE_OR_UPDATE: Self = Self(OPERATION_CREATE | OPERATION_UPDATE);
    /// Everything.
    pub const ALL: Self = Self(OPERATION_CREATE | OPERATION_UPDATE | OPERATION_DELETE);

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether `operation` is in the set.
    pub fn contains(self, operation: Operation) -> bool {
        self.0 & operation.tag() != 0
    }
}

impl From<Operation> for OperationMask {
    fn from(operation: Operation) -> Self {
        Self(operation.tag())
    }
}

impl BitOr for OperationMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for OperationMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Operation::Create, "CREATE"),
            (Operation::Update, "UPDATE"),
            (Operation::Delete, "DELETE"),
        ]
        .into_iter()
        .filter(|(op, _)| self.contains(*op))
        .map(|(_, name)| name)
        .collect();
        write!(f, "OperationMask({})", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_tags() {
        assert_eq!(serde_json::to_string(&Goal::Subscribe).unwrap(), "3");
        assert_eq!(serde_json::from_str::<Goal>("6").unwrap(), Goal::Data);
        assert!(serde_json::from_str::<Goal>("9").is_err());
        assert_eq!(Goal::try_from(7), Err(ProtocolError::UnknownGoal(7)));
    }

    #[test]
    fn test_mask_membership() {
        let mask = OperationMask::CREATE_OR_UPDATE;
        assert_eq!(mask.bits(), 3);
        assert!(mask.contains(Operation::Create));
        assert!(mask.contains(Operation::Update));
        assert!(!mask.contains(Operation::Delete));
        assert_eq!(OperationMask::CREATE | OperationMask::DELETE, OperationMask(5));
    }

    #[test]
    fn test_operation_is_concrete() {
        assert_eq!(Operation::from_tag(2).unwrap(), Operation::Update);
        assert_eq!(Operation::from_tag(3), Err(ProtocolError::UnknownOperation(3)));
        assert!(Operation::from_tag(300).is_err());
    }
}
