//! Transaction definitions and status.

use crate::error::HandoffError;
use crate::types::{SuspendedResources, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How `begin` relates a new unit of work to the ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Propagation {
    /// Join the ambient transaction, or start one if there is none.
    #[default]
    Required,
    /// Join the ambient transaction, or run without one.
    Supports,
    /// Join the ambient transaction; fail if there is none.
    Mandatory,
    /// Suspend the ambient transaction (if any) and start a new one.
    RequiresNew,
    /// Suspend the ambient transaction (if any) and run without one.
    NotSupported,
    /// Run without a transaction; fail if one is active.
    Never,
}

impl Propagation {
    /// Returns the attribute name of this propagation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Required => "Required",
            Self::Supports => "Supports",
            Self::Mandatory => "Mandatory",
            Self::RequiresNew => "RequiresNew",
            Self::NotSupported => "NotSupported",
            Self::Never => "Never",
        }
    }

    /// Returns true if units of work with this propagation always run in a
    /// transaction.
    #[must_use]
    pub const fn is_transacted(self) -> bool {
        matches!(self, Self::Required | Self::RequiresNew | Self::Mandatory)
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Propagation {
    type Err = HandoffError;

    /// Parses attribute names case-insensitively, ignoring underscores, so
    /// `RequiresNew`, `REQUIRES_NEW` and `requires_new` are all accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "required" => Ok(Self::Required),
            "supports" => Ok(Self::Supports),
            "mandatory" => Ok(Self::Mandatory),
            "requiresnew" => Ok(Self::RequiresNew),
            "notsupported" => Ok(Self::NotSupported),
            "never" => Ok(Self::Never),
            _ => Err(HandoffError::InvalidPropagation {
                value: s.to_string(),
            }),
        }
    }
}

/// Parameters for starting a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionDefinition {
    /// Propagation behaviour.
    pub propagation: Propagation,
    /// Timeout for a newly started transaction.
    pub timeout: Option<Duration>,
    /// Read-only hint for the resources.
    pub read_only: bool,
    /// Optional name, used in logs.
    pub name: Option<String>,
}

impl TransactionDefinition {
    /// Creates a definition with the given propagation.
    #[must_use]
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the definition read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Sets the name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// An outer transaction that `begin` detached to make room for a new one.
#[derive(Debug)]
pub struct SuspendedTransaction {
    /// The detached transaction.
    pub transaction: TransactionId,
    /// Resources required to re-attach it.
    pub resources: SuspendedResources,
}

/// Result of [`TransactionManager::begin`](crate::TransactionManager::begin).
///
/// Must be handed back to exactly one of `commit` or `rollback`.
#[derive(Debug)]
#[must_use = "a transaction status must be committed or rolled back"]
pub struct TransactionStatus {
    transaction: Option<TransactionId>,
    new_transaction: bool,
    rollback_only: bool,
    suspended: Option<SuspendedTransaction>,
    definition: TransactionDefinition,
}

impl TransactionStatus {
    /// Creates a status.
    pub fn new(
        transaction: Option<TransactionId>,
        new_transaction: bool,
        definition: TransactionDefinition,
    ) -> Self {
        Self {
            transaction,
            new_transaction,
            rollback_only: false,
            suspended: None,
            definition,
        }
    }

    /// Records the outer transaction detached by `begin`.
    pub fn with_suspended(mut self, suspended: Option<SuspendedTransaction>) -> Self {
        self.suspended = suspended;
        self
    }

    /// Returns the transaction this unit of work runs in, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    /// Returns true if this unit of work runs in a transaction.
    #[must_use]
    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Returns true if `begin` started the transaction (rather than joined it).
    #[must_use]
    pub fn is_new_transaction(&self) -> bool {
        self.new_transaction
    }

    /// Returns true if the unit of work may only roll back.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Marks the unit of work rollback-only; a later commit rolls back.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Returns the definition this status was created from.
    #[must_use]
    pub fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    /// Returns the detached outer transaction, if any.
    #[must_use]
    pub fn suspended(&self) -> Option<&SuspendedTransaction> {
        self.suspended.as_ref()
    }

    /// Takes the detached outer transaction so it can be re-attached.
    pub fn take_suspended(&mut self) -> Option<SuspendedTransaction> {
        self.suspended.take()
    }
}
