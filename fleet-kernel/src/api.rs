//! Enveloppe de réponse commune à toutes les opérations opérateur.
//!
//! `success=false` + `partial=true` : une partie des nœuds/éléments a réussi,
//! le détail est dans `data`.

use crate::error::{ErrorKind, FleetError};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

fn to_data<T: Serialize>(data: &T) -> Option<Value> {
    match serde_json::to_value(data) {
        Ok(Value::Null) => None,
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[api] response data not serializable: {}", e);
            None
        }
    }
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error_kind: None,
            partial: false,
        }
    }

    pub fn ok_with<T: Serialize>(message: impl Into<String>, data: &T) -> Self {
        Self {
            data: to_data(data),
            ..Self::ok(message)
        }
    }

    pub fn fail(err: &FleetError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: None,
            error_kind: Some(err.kind()),
            partial: false,
        }
    }

    /// Échec agrégé d'un fan-out ; `partial` si au moins un élément a réussi
    pub fn incomplete<T: Serialize>(message: impl Into<String>, data: &T, partial: bool) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: to_data(data),
            error_kind: None,
            partial,
        }
    }

    pub fn from_result<T: Serialize>(res: crate::error::Result<T>, message: impl FnOnce(&T) -> String) -> Self {
        match res {
            Ok(value) => {
                let msg = message(&value);
                Self::ok_with(msg, &value)
            }
            Err(e) => Self::fail(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_carries_kind() {
        let resp = ApiResponse::fail(&FleetError::NotFound("Node ghost not found".into()));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorKind"], "not_found");
        assert!(json.get("data").is_none());
        assert!(json.get("partial").is_none());
    }

    #[test]
    fn test_incomplete_marks_partial() {
        let resp = ApiResponse::incomplete("1/2 nodes", &serde_json::json!({"w1": true}), true);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["partial"], true);
        assert_eq!(json["data"]["w1"], true);
    }
}
