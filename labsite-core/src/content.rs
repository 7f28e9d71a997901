//! Content records served by the lab backend.
//!
//! Records keep both `id` and the legacy `_id` spelling. The transport adds
//! `_id` to every record that lacks it, and older endpoints only send `_id`;
//! [`Project::id`] and friends resolve whichever is present.

use crate::error::{LabError, LabResult};
use crate::ordering::{apply_category_order, distinct_in_order};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Prefix of ids generated locally for provisional (optimistic) records.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Generate a provisional record id.
pub fn temporary_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::now_v7())
}

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Identifier of a JSON record: `id`, falling back to `_id`.
///
/// Numeric ids are rendered in decimal.
pub fn record_id(record: &Value) -> Option<String> {
    let object = record.as_object()?;
    ["id", "_id"].iter().find_map(|field| match object.get(*field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Decode a JSON list payload into typed records.
pub fn decode_records<T: DeserializeOwned>(payload: &Value) -> LabResult<Vec<T>> {
    serde_json::from_value(payload.clone()).map_err(|e| LabError::transform(e.to_string()))
}

/// Decode a single JSON record.
pub fn decode_record<T: DeserializeOwned>(payload: &Value) -> LabResult<T> {
    serde_json::from_value(payload.clone()).map_err(|e| LabError::transform(e.to_string()))
}

/// An id as sent over the wire: backends use strings or integers.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(serde_json::Number),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
        }
    }
}

fn id_from_wire<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<WireId>::deserialize(deserializer)?
        .map(WireId::into_string)
        .unwrap_or_default())
}

fn legacy_id_from_wire<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<WireId>::deserialize(deserializer)?.map(WireId::into_string))
}

fn resolve_id<'a>(id: &'a str, legacy_id: &'a Option<String>) -> &'a str {
    if id.is_empty() {
        legacy_id.as_deref().unwrap_or("")
    } else {
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Current,
    Past,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Past => "past",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "current" => Some(Self::Current),
            "past" => Some(Self::Past),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(default, deserialize_with = "id_from_wire")]
    pub id: String,
    #[serde(
        rename = "_id",
        default,
        deserialize_with = "legacy_id_from_wire",
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: ProjectStatus,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Project {
    pub fn id(&self) -> &str {
        resolve_id(&self.id, &self.legacy_id)
    }

    pub fn is_provisional(&self) -> bool {
        is_temporary_id(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    #[serde(default, deserialize_with = "id_from_wire")]
    pub id: String,
    #[serde(
        rename = "_id",
        default,
        deserialize_with = "legacy_id_from_wire",
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    /// Publication date as sent by the backend (`YYYY-MM-DD` or RFC 3339).
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl NewsItem {
    pub fn id(&self) -> &str {
        resolve_id(&self.id, &self.legacy_id)
    }

    pub fn published_on(&self) -> Option<NaiveDate> {
        let date = self.date.as_deref()?;
        let day = date.get(..10)?;
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryImage {
    #[serde(default, deserialize_with = "id_from_wire")]
    pub id: String,
    #[serde(
        rename = "_id",
        default,
        deserialize_with = "legacy_id_from_wire",
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_id: Option<String>,
    pub url: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl GalleryImage {
    pub fn id(&self) -> &str {
        resolve_id(&self.id, &self.legacy_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publication {
    #[serde(default, deserialize_with = "id_from_wire")]
    pub id: String,
    #[serde(
        rename = "_id",
        default,
        deserialize_with = "legacy_id_from_wire",
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub link: Option<String>,
}

impl Publication {
    pub fn id(&self) -> &str {
        resolve_id(&self.id, &self.legacy_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    #[serde(default, deserialize_with = "id_from_wire")]
    pub id: String,
    #[serde(
        rename = "_id",
        default,
        deserialize_with = "legacy_id_from_wire",
        skip_serializing_if = "Option::is_none"
    )]
    pub legacy_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

impl TeamMember {
    pub fn id(&self) -> &str {
        resolve_id(&self.id, &self.legacy_id)
    }
}

/// Editable text of one page (`about`, `home`, `projects`, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageMeta {
    pub fields: Map<String, Value>,
}

impl PageMeta {
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Saved category ordering (`categoryOrder`), if the page stores one.
    pub fn category_order(&self) -> Option<Vec<String>> {
        let order = self.fields.get("categoryOrder")?.as_array()?;
        Some(
            order
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        )
    }
}

/// Categories used by `projects`, ordered by the page's saved ordering.
pub fn ordered_project_categories(projects: &[Project], meta: Option<&PageMeta>) -> Vec<String> {
    let categories = distinct_in_order(projects.iter().filter_map(|p| p.category.clone()));
    let saved = meta.and_then(PageMeta::category_order);
    apply_category_order(&categories, saved.as_deref())
}
