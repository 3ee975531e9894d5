use sea_orm::ActiveValue::Set;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::{Document, DocumentRole, DocumentStatus, OriginalReference, SourceKind};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "dispatch_documents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub dispatch_id: Uuid,
    #[sea_orm(unique)]
    pub reference: String,
    #[sea_orm(column_type = "Text")]
    pub title: String,
    pub role: DocumentRole,
    pub status: DocumentStatus,
    pub source: SourceKind,
    pub template_code: Option<String>,
    pub original_dispatch_id: Option<Uuid>,
    pub original_archive_id: Option<String>,
    pub original_document_reference: Option<String>,
    pub archive_reference: Option<String>,
    pub production_ref: Option<String>,
    pub sort_index: i32,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub redaction_metadata: Option<Json>,
    pub status_changed_at: DateTimeWithTimeZone,
    pub created_at: DateTimeWithTimeZone,
    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::dispatch::Entity",
        from = "Column::DispatchId",
        to = "super::dispatch::Column::Id"
    )]
    Dispatch,
}

impl Related<super::dispatch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Dispatch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for Document {
    fn from(model: Model) -> Self {
        let original = OriginalReference {
            dispatch_id: model.original_dispatch_id,
            archive_id: model.original_archive_id,
            document_reference: model.original_document_reference,
        };
        let has_original = original.dispatch_id.is_some()
            || original.archive_id.is_some()
            || original.document_reference.is_some();

        Self {
            id: model.id,
            dispatch_id: model.dispatch_id,
            reference: model.reference,
            title: model.title,
            role: model.role,
            status: model.status,
            source: model.source,
            template_code: model.template_code,
            original: has_original.then_some(original),
            archive_reference: model.archive_reference,
            production_ref: model.production_ref,
            index: model.sort_index,
            redaction_metadata: model.redaction_metadata,
            status_changed_at: model.status_changed_at.into(),
            created_at: model.created_at.into(),
            deleted_at: model.deleted_at.map(Into::into),
        }
    }
}

impl From<&Document> for ActiveModel {
    fn from(document: &Document) -> Self {
        let original = document.original.clone().unwrap_or_default();

        ActiveModel {
            id: Set(document.id),
            dispatch_id: Set(document.dispatch_id),
            reference: Set(document.reference.clone()),
            title: Set(document.title.clone()),
            role: Set(document.role),
            status: Set(document.status),
            source: Set(document.source),
            template_code: Set(document.template_code.clone()),
            original_dispatch_id: Set(original.dispatch_id),
            original_archive_id: Set(original.archive_id),
            original_document_reference: Set(original.document_reference),
            archive_reference: Set(document.archive_reference.clone()),
            production_ref: Set(document.production_ref.clone()),
            sort_index: Set(document.index),
            redaction_metadata: Set(document.redaction_metadata.clone()),
            status_changed_at: Set(document.status_changed_at.into()),
            created_at: Set(document.created_at.into()),
            deleted_at: Set(document.deleted_at.map(Into::into)),
        }
    }
}
