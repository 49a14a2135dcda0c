use serde::{Deserialize, Serialize};

/// Identifier assigned to a handler record by the store
pub type HandlerId = i64;

/// Stored description of a registered handler.
///
/// The executable itself lives in the engine's registry; storage only keeps
/// the name so the API can list what is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerRecord {
    pub id: HandlerId,
    pub name: String,
}

impl HandlerRecord {
    pub fn new(id: HandlerId, name: impl Into<String>) -> Self {
        HandlerRecord {
            id,
            name: name.into(),
        }
    }

    /// A record is only usable once the store gave it a non-zero id
    pub fn has_valid_id(&self) -> bool {
        self.id != 0
    }
}
