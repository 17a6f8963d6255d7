use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::UnknownVariant;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(EvaluationId);
id_newtype!(PhotoId);
id_newtype!(ReportId);
id_newtype!(CityId);

macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant::new($kind, value)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Evaluator,
    Admin,
}

wire_enum!(Role, "role", {
    User => "user",
    Evaluator => "evaluator",
    Admin => "admin",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Created,
    Accepted,
    InProgress,
    Completed,
    Canceled,
}

wire_enum!(EvaluationStatus, "evaluation status", {
    Created => "created",
    Accepted => "accepted",
    InProgress => "in_progress",
    Completed => "completed",
    Canceled => "canceled",
});

impl EvaluationStatus {
    /// No status-changing action leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Draft,
    Finalized,
}

wire_enum!(ReportStatus, "report status", {
    Draft => "draft",
    Finalized => "finalized",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default, deserialize_with = "nullable_string")]
    pub full_name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub email: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub phone: String,
    pub role: Role,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvaluationId,
    pub status: EvaluationStatus,
    pub requester_id: UserId,
    #[serde(
        default,
        deserialize_with = "optional_user_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub evaluator_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_id: Option<CityId>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub vehicle_make: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub vehicle_model: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub vehicle_plate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_year: Option<i32>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "nullable_vec", skip_serializing_if = "Vec::is_empty")]
    pub photos: Vec<EvaluationPhoto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
}

impl Evaluation {
    /// An evaluator is assigned exactly when the evaluation has left `created`.
    /// Canceled evaluations may or may not carry one, since cancel is reachable
    /// from `created`.
    pub fn assignment_is_consistent(&self) -> bool {
        match self.status {
            EvaluationStatus::Created => self.evaluator_id.is_none(),
            EvaluationStatus::Accepted
            | EvaluationStatus::InProgress
            | EvaluationStatus::Completed => self.evaluator_id.is_some(),
            EvaluationStatus::Canceled => true,
        }
    }

    pub fn is_assigned_to(&self, user_id: UserId) -> bool {
        self.evaluator_id == Some(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EvaluationPhotoWire")]
pub struct EvaluationPhoto {
    pub id: PhotoId,
    pub evaluation_id: EvaluationId,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

// Photo payloads carry the address as either `photo_url` or `url`.
#[derive(Deserialize)]
struct EvaluationPhotoWire {
    id: PhotoId,
    evaluation_id: EvaluationId,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size_bytes: Option<u64>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl From<EvaluationPhotoWire> for EvaluationPhoto {
    fn from(wire: EvaluationPhotoWire) -> Self {
        let url = wire
            .url
            .filter(|url| !url.is_empty())
            .or(wire.photo_url)
            .unwrap_or_default();
        Self {
            id: wire.id,
            evaluation_id: wire.evaluation_id,
            url,
            content_type: wire.content_type,
            size_bytes: wire.size_bytes,
            created_at: wire.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub evaluation_id: EvaluationId,
    #[serde(
        default,
        deserialize_with = "optional_user_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub evaluator_id: Option<UserId>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub summary: String,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Report {
    pub fn is_draft(&self) -> bool {
        self.status == ReportStatus::Draft
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ReportFileWire")]
pub struct ReportFile {
    pub url: String,
}

#[derive(Deserialize)]
struct ReportFileWire {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    file_url: Option<String>,
}

impl From<ReportFileWire> for ReportFile {
    fn from(wire: ReportFileWire) -> Self {
        Self {
            url: wire
                .url
                .filter(|url| !url.is_empty())
                .or(wire.file_url)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub id: CityId,
    pub name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub state: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub country: String,
}

/// `null`, `0` and a missing field all mean "nobody assigned".
fn optional_user_id<'de, D>(deserializer: D) -> Result<Option<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.filter(|id| *id > 0).map(UserId))
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn nullable_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
