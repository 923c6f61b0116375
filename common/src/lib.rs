mod depot;
mod exnode;
mod size;

pub use depot::*;
pub use exnode::*;
pub use size::*;

use serde::{Deserialize, Serialize};
use std::{fmt::Display, ops::Deref, str::FromStr};
use uuid::Uuid;

/// Identifier of an exnode record in the metadata registry.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExnodeId(Uuid);

impl Default for ExnodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for ExnodeId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Uuid> for ExnodeId {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl Display for ExnodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0.to_string().as_str()))
    }
}

impl FromStr for ExnodeId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ExnodeId(Uuid::parse_str(s)?))
    }
}

impl ExnodeId {
    pub fn new() -> Self {
        ExnodeId(Uuid::new_v4())
    }
}
