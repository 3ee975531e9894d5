use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Dispatches::Table)
                    .if_not_exists()
                    .col(pk_uuid(Dispatches::Id))
                    .col(string(Dispatches::CaseNumber))
                    .col(string(Dispatches::SubjectIdent))
                    .col(json_binary_null(Dispatches::Recipient))
                    .col(string(Dispatches::Tema))
                    .col(string(Dispatches::Kind))
                    .col(string(Dispatches::Status))
                    .col(text_null(Dispatches::Title))
                    .col(string(Dispatches::Unit))
                    .col(string(Dispatches::Language).default("NB"))
                    .col(string_null(Dispatches::TreatmentId))
                    .col(string_null(Dispatches::DecisionId))
                    .col(json_binary_null(Dispatches::FollowUp))
                    .col(string_null(Dispatches::ArchiveId))
                    .col(string_null(Dispatches::DistributionOrderId))
                    .col(string_null(Dispatches::DistributionChannel))
                    .col(string_null(Dispatches::DistributedBy))
                    .col(timestamp_with_time_zone_null(Dispatches::DistributedAt))
                    .col(string_null(Dispatches::DistributionBatchId))
                    .col(timestamp_with_time_zone_null(Dispatches::DistributionConfirmedAt))
                    .col(timestamp_with_time_zone_null(
                        Dispatches::DistributionEventPublishedAt,
                    ))
                    .col(string(Dispatches::CreatedBy))
                    .col(
                        timestamp_with_time_zone(Dispatches::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(string(Dispatches::UpdatedBy))
                    .col(
                        timestamp_with_time_zone(Dispatches::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(Dispatches::FinalizedAt))
                    .col(string_null(Dispatches::AbortedBy))
                    .col(timestamp_with_time_zone_null(Dispatches::AbortedAt))
                    .col(big_integer(Dispatches::Version).default(0))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DispatchDocuments::Table)
                    .if_not_exists()
                    .col(pk_uuid(DispatchDocuments::Id))
                    .col(uuid(DispatchDocuments::DispatchId))
                    .col(string(DispatchDocuments::Reference).unique_key())
                    .col(text(DispatchDocuments::Title))
                    .col(string(DispatchDocuments::Role))
                    .col(string(DispatchDocuments::Status))
                    .col(string(DispatchDocuments::Source))
                    .col(string_null(DispatchDocuments::TemplateCode))
                    .col(uuid_null(DispatchDocuments::OriginalDispatchId))
                    .col(string_null(DispatchDocuments::OriginalArchiveId))
                    .col(string_null(DispatchDocuments::OriginalDocumentReference))
                    .col(string_null(DispatchDocuments::ArchiveReference))
                    .col(string_null(DispatchDocuments::ProductionRef))
                    .col(integer(DispatchDocuments::SortIndex))
                    .col(json_binary_null(DispatchDocuments::RedactionMetadata))
                    .col(timestamp_with_time_zone(DispatchDocuments::StatusChangedAt))
                    .col(
                        timestamp_with_time_zone(DispatchDocuments::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(DispatchDocuments::DeletedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_dispatch_documents_dispatch_id")
                            .from(DispatchDocuments::Table, DispatchDocuments::DispatchId)
                            .to(Dispatches::Table, Dispatches::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Status queries of the reconciliation jobs
        manager
            .create_index(
                Index::create()
                    .name("idx_dispatches_status")
                    .table(Dispatches::Table)
                    .col(Dispatches::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dispatch_documents_dispatch_id")
                    .table(DispatchDocuments::Table)
                    .col(DispatchDocuments::DispatchId)
                    .to_owned(),
            )
            .await?;

        // Event fan-out looks documents up by their original's reference
        manager
            .create_index(
                Index::create()
                    .name("idx_dispatch_documents_original_reference")
                    .table(DispatchDocuments::Table)
                    .col(DispatchDocuments::OriginalDocumentReference)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_dispatch_documents_status")
                    .table(DispatchDocuments::Table)
                    .col(DispatchDocuments::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DispatchDocuments::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Dispatches::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Dispatches {
    Table,
    Id,
    CaseNumber,
    SubjectIdent,
    Recipient,
    Tema,
    Kind,
    Status,
    Title,
    Unit,
    Language,
    TreatmentId,
    DecisionId,
    FollowUp,
    ArchiveId,
    DistributionOrderId,
    DistributionChannel,
    DistributedBy,
    DistributedAt,
    DistributionBatchId,
    DistributionConfirmedAt,
    DistributionEventPublishedAt,
    CreatedBy,
    CreatedAt,
    UpdatedBy,
    UpdatedAt,
    FinalizedAt,
    AbortedBy,
    AbortedAt,
    Version,
}

#[derive(DeriveIden)]
enum DispatchDocuments {
    Table,
    Id,
    DispatchId,
    Reference,
    Title,
    Role,
    Status,
    Source,
    TemplateCode,
    OriginalDispatchId,
    OriginalArchiveId,
    OriginalDocumentReference,
    ArchiveReference,
    ProductionRef,
    SortIndex,
    RedactionMetadata,
    StatusChangedAt,
    CreatedAt,
    DeletedAt,
}
