use sea_orm::ActiveValue::Set;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};
use crate::models::{Dispatch, DispatchKind, DispatchStatus, DistributionChannel, Tema};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "dispatches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub case_number: String,
    pub subject_ident: String,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub recipient: Option<Json>,
    pub tema: Tema,
    pub kind: DispatchKind,
    pub status: DispatchStatus,
    #[sea_orm(column_type = "Text", nullable)]
    pub title: Option<String>,
    pub unit: String,
    pub language: String,
    pub treatment_id: Option<String>,
    pub decision_id: Option<String>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub follow_up: Option<Json>,
    pub archive_id: Option<String>,
    pub distribution_order_id: Option<String>,
    pub distribution_channel: Option<DistributionChannel>,
    pub distributed_by: Option<String>,
    pub distributed_at: Option<DateTimeWithTimeZone>,
    pub distribution_batch_id: Option<String>,
    pub distribution_confirmed_at: Option<DateTimeWithTimeZone>,
    pub distribution_event_published_at: Option<DateTimeWithTimeZone>,
    pub created_by: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_by: String,
    pub updated_at: DateTimeWithTimeZone,
    pub finalized_at: Option<DateTimeWithTimeZone>,
    pub aborted_by: Option<String>,
    pub aborted_at: Option<DateTimeWithTimeZone>,
    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::document::Entity")]
    Documents,
}

impl Related<super::document::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Documents.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

fn to_json<T: Serialize>(value: &Option<T>) -> DispatchResult<Option<Json>> {
    value
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| DispatchError::Internal(format!("Failed to encode column: {}", e)))
}

pub(super) fn from_json<T: serde::de::DeserializeOwned>(
    value: Option<Json>,
) -> DispatchResult<Option<T>> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| DispatchError::Internal(format!("Failed to decode column: {}", e)))
}

impl ActiveModel {
    /// Every column of the aggregate root; `version` is the value to store
    pub fn from_domain(dispatch: &Dispatch, version: i64) -> DispatchResult<Self> {
        let proceeding = dispatch.proceeding.clone().unwrap_or_default();
        let distribution = dispatch.distribution.as_ref();

        Ok(ActiveModel {
            id: Set(dispatch.id),
            case_number: Set(dispatch.case_number.clone()),
            subject_ident: Set(dispatch.subject_ident.clone()),
            recipient: Set(to_json(&dispatch.recipient)?),
            tema: Set(dispatch.tema),
            kind: Set(dispatch.kind),
            status: Set(dispatch.status),
            title: Set(dispatch.title.clone()),
            unit: Set(dispatch.unit.clone()),
            language: Set(dispatch.language.clone()),
            treatment_id: Set(proceeding.treatment_id),
            decision_id: Set(proceeding.decision_id),
            follow_up: Set(to_json(&dispatch.follow_up)?),
            archive_id: Set(dispatch.archive_id.clone()),
            distribution_order_id: Set(distribution.and_then(|d| d.order_id.clone())),
            distribution_channel: Set(distribution.map(|d| d.channel)),
            distributed_by: Set(distribution.map(|d| d.distributed_by.clone())),
            distributed_at: Set(distribution.map(|d| d.distributed_at.into())),
            distribution_batch_id: Set(distribution.and_then(|d| d.batch_id.clone())),
            distribution_confirmed_at: Set(
                distribution.and_then(|d| d.confirmed_at.map(Into::into))
            ),
            distribution_event_published_at: Set(
                distribution.and_then(|d| d.event_published_at.map(Into::into))
            ),
            created_by: Set(dispatch.created_by.clone()),
            created_at: Set(dispatch.created_at.into()),
            updated_by: Set(dispatch.updated_by.clone()),
            updated_at: Set(dispatch.updated_at.into()),
            finalized_at: Set(dispatch.finalized_at.map(Into::into)),
            aborted_by: Set(dispatch.aborted_by.clone()),
            aborted_at: Set(dispatch.aborted_at.map(Into::into)),
            version: Set(version),
        })
    }
}
