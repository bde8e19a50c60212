use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelList {
    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I, owned_by: &str) -> Self {
        Self {
            object: "list".to_string(),
            data: ids
                .into_iter()
                .map(|id| ModelObject {
                    id,
                    object: "model".to_string(),
                    created: 1_626_777_600,
                    owned_by: owned_by.to_string(),
                })
                .collect(),
        }
    }
}
