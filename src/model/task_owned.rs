use std::fmt::Debug;

use bitcoin::Amount;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FiatSwapError;

/// A value that is absent until the one task permitted to write it does so.
/// Writing the same value again is a no-op, so a task re-run after a restart
/// stays harmless. Writing a different value is a contract violation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskOwned<T>(Option<T>);

impl<T> Default for TaskOwned<T> {
    fn default() -> Self {
        TaskOwned(None)
    }
}

impl<T: PartialEq + Debug> TaskOwned<T> {
    pub fn get(&self) -> Option<&T> {
        self.0.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub(crate) fn set(&mut self, field: &str, value: T) -> Result<(), FiatSwapError> {
        match &self.0 {
            Some(existing) if *existing == value => Ok(()),
            Some(existing) => Err(FiatSwapError::contract(format!(
                "{} already set to {:?}, refusing {:?}",
                field, existing, value
            ))),
            None => {
                self.0 = Some(value);
                Ok(())
            }
        }
    }

    /// For tasks reading what an earlier task must have written.
    pub(crate) fn require(&self, field: &str) -> Result<&T, FiatSwapError> {
        self.0
            .as_ref()
            .ok_or_else(|| FiatSwapError::contract(format!("{} read before it was set", field)))
    }

    /// Local identity is re-derived from live services on every construction
    /// and may legitimately replace what was persisted.
    pub(crate) fn assign_local(&mut self, value: T) {
        self.0 = Some(value);
    }
}

/// `TaskOwned<Amount>` as an optional number of satoshis.
pub(crate) mod amount_as_sat {
    use super::*;

    pub fn serialize<S: Serializer>(field: &TaskOwned<Amount>, s: S) -> Result<S::Ok, S::Error> {
        bitcoin::amount::serde::as_sat::opt::serialize(&field.0, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TaskOwned<Amount>, D::Error> {
        bitcoin::amount::serde::as_sat::opt::deserialize(d).map(TaskOwned)
    }
}
