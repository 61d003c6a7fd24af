use crate::model::feature::Feature;
use serde::{Serialize, Serializer};

/// The fixed vocabulary reported for failed rows. Database error text never
/// reaches a [`ModificationFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureMessage {
    InsertGeneral,
    UpdateGeneral,
    UpdateNotExists,
    UpdateUuid,
    UpdateIdMissing,
    UpdatePuuidMissing,
    DeleteGeneral,
    DeleteNotExists,
    DeleteUuid,
    TransactionGeneral,
}

impl FailureMessage {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureMessage::InsertGeneral => "Insert has failed",
            FailureMessage::UpdateGeneral => "Update has failed",
            FailureMessage::UpdateNotExists | FailureMessage::DeleteNotExists => {
                "Object does not exist"
            }
            FailureMessage::UpdateUuid | FailureMessage::DeleteUuid => {
                "Object does not exist or UUID mismatch"
            }
            FailureMessage::UpdateIdMissing => "Feature Id is missing",
            FailureMessage::UpdatePuuidMissing => "Feature puuid is missing",
            FailureMessage::DeleteGeneral => "Delete has failed",
            FailureMessage::TransactionGeneral => "Transaction has failed",
        }
    }
}

impl std::fmt::Display for FailureMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FailureMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModificationFailure {
    pub id: Option<String>,
    pub message: FailureMessage,
}

impl ModificationFailure {
    pub fn new(id: Option<String>, message: FailureMessage) -> Self {
        Self { id, message }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationResult {
    /// Succeeded features in their new head state.
    pub features: Vec<Feature>,
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<ModificationFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_features: Option<Vec<Feature>>,
}

impl ModificationResult {
    pub fn failure_for(&self, id: &str) -> Option<FailureMessage> {
        self.failed
            .iter()
            .find(|f| f.id.as_deref() == Some(id))
            .map(|f| f.message)
    }

    pub fn succeeded_count(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}
