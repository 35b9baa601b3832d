use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProjectError;
use crate::ids::MemberId;

/// Parameters given when a project is created. Immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationParams {
    pub name: String,
    /// Template materialized into the project filesystem (empty for none).
    #[serde(default)]
    pub template: String,
    /// Whether an empty tutorial file is written at creation.
    #[serde(default)]
    pub add_tut_file: bool,
}

/// An application declared by the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    /// Path of the application's main module in the project filesystem.
    pub module_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployment: Option<DateTime<Utc>>,
}

/// A secret stored in the project record itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSecret {
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// A project member, looked up either by id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
}

/// Durable record of a project, stored as JSON under `/projects/<id>`.
///
/// Optional collections absent (or `null`) in the stored JSON load as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectData {
    pub creation_params: CreationParams,
    #[serde(default, deserialize_with = "null_as_default")]
    pub applications: BTreeMap<String, ApplicationRecord>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub secrets: BTreeMap<String, LocalSecret>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub members: Vec<Member>,
}

impl ProjectData {
    pub fn new(creation_params: CreationParams) -> Self {
        Self {
            creation_params,
            ..Default::default()
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProjectError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProjectError> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_collections_load_empty() {
        let json = br#"{"creationParams":{"name":"blog","template":"","addTutFile":false}}"#;
        let data = ProjectData::from_json(json).unwrap();
        assert_eq!(data.creation_params.name, "blog");
        assert!(data.applications.is_empty());
        assert!(data.secrets.is_empty());
        assert!(data.members.is_empty());
    }

    #[test]
    fn test_null_collections_load_empty() {
        let json = br#"{
            "creationParams": {"name": "blog"},
            "applications": null,
            "secrets": null,
            "members": null
        }"#;
        let data = ProjectData::from_json(json).unwrap();
        assert!(data.applications.is_empty());
        assert!(data.secrets.is_empty());
        assert!(data.members.is_empty());
    }

    #[test]
    fn test_json_layout() {
        let data = ProjectData::new(CreationParams {
            name: "blog".into(),
            template: "web-app-min".into(),
            add_tut_file: true,
        });
        let value: serde_json::Value = serde_json::from_slice(&data.to_json().unwrap()).unwrap();
        assert_eq!(value["creationParams"]["name"], "blog");
        assert_eq!(value["creationParams"]["template"], "web-app-min");
        assert_eq!(value["creationParams"]["addTutFile"], true);
    }

    #[test]
    fn test_populated_record_survives_json() {
        let mut data = ProjectData::new(CreationParams {
            name: "shop".into(),
            ..Default::default()
        });
        data.applications.insert(
            "main".into(),
            ApplicationRecord {
                module_path: "/main.ix".into(),
                last_deployment: Some(Utc::now()),
            },
        );
        data.secrets.insert(
            "API_KEY".into(),
            LocalSecret {
                value: "s3cr3t".into(),
                created_at: Utc::now(),
            },
        );
        data.members.push(Member {
            id: MemberId("m1".into()),
            name: "alice".into(),
        });

        let reloaded = ProjectData::from_json(&data.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, data);
    }

    #[test]
    fn test_malformed_record_is_serialization_error() {
        let err = ProjectData::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, ProjectError::Serialization(_)));
    }
}
