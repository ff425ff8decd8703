//! Strongly-typed identifiers for Rampart entities
//!
//! Caller-named entities (tenants, components, resources, services) wrap the
//! name they were given. Records created by the core itself are UUID-based.
//! Both are newtypes so a resource id can never be passed where a holder id
//! is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! named_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

macro_rules! generated_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

named_id!(
    /// Tenant identifier. No state or escalation crosses this boundary.
    OrgId
);
named_id!(
    /// A monitored component (subsystem, worker, adapter).
    ComponentId
);
named_id!(
    /// A lockable or contended resource.
    ResourceId
);
named_id!(
    /// The party holding or waiting for a resource lock.
    HolderId
);
named_id!(
    /// The party touching a contended resource.
    AccessorId
);
named_id!(
    /// Logical service name used for discovery.
    ServiceId
);
named_id!(
    /// Event bus subscriber.
    SubscriberId
);
named_id!(
    /// Node taking part in a distributed transaction.
    NodeId
);

generated_id!(
    /// Escalation record identifier
    EscalationId,
    "esc"
);
generated_id!(
    /// Resource lock identifier
    LockId,
    "lock"
);
generated_id!(
    /// Published event identifier
    EventId,
    "evt"
);
generated_id!(
    /// Distributed transaction identifier
    TransactionId,
    "txn"
);
generated_id!(
    /// Generic record identifier for audit-style records
    /// (recoveries, validations, plans, requests).
    RecordId,
    "rec"
);
