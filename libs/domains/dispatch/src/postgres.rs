use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::entity::{self, dispatch, document};
use crate::error::{DispatchError, DispatchResult};
use crate::models::{Dispatch, DispatchKind, DispatchStatus, DocumentStatus};
use crate::repository::DispatchRepository;

pub struct PgDispatchRepository {
    db: DatabaseConnection,
}

impl PgDispatchRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Attach document rows to a page of dispatch rows, keeping the page order
    async fn hydrate(&self, models: Vec<dispatch::Model>) -> DispatchResult<Vec<Dispatch>> {
        if models.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<Uuid> = models.iter().map(|m| m.id).collect();
        let rows = document::Entity::find()
            .filter(document::Column::DispatchId.is_in(ids))
            .order_by_asc(document::Column::SortIndex)
            .all(&self.db)
            .await?;

        let mut by_dispatch: HashMap<Uuid, Vec<document::Model>> = HashMap::new();
        for row in rows {
            by_dispatch.entry(row.dispatch_id).or_default().push(row);
        }

        models
            .into_iter()
            .map(|model| {
                let documents = by_dispatch.remove(&model.id).unwrap_or_default();
                entity::into_domain(model, documents)
            })
            .collect()
    }

    async fn write_documents<C: ConnectionTrait>(
        conn: &C,
        dispatch: &Dispatch,
    ) -> DispatchResult<()> {
        if !dispatch.documents.is_empty() {
            let rows: Vec<document::ActiveModel> =
                dispatch.documents.iter().map(Into::into).collect();

            document::Entity::insert_many(rows)
                .on_conflict(
                    OnConflict::column(document::Column::Id)
                        .update_columns([
                            document::Column::Title,
                            document::Column::Role,
                            document::Column::Status,
                            document::Column::TemplateCode,
                            document::Column::ArchiveReference,
                            document::Column::ProductionRef,
                            document::Column::SortIndex,
                            document::Column::RedactionMetadata,
                            document::Column::StatusChangedAt,
                            document::Column::DeletedAt,
                        ])
                        .to_owned(),
                )
                .exec(conn)
                .await?;
        }

        // Purged documents are simply missing from the aggregate
        let kept: Vec<Uuid> = dispatch.documents.iter().map(|d| d.id).collect();
        document::Entity::delete_many()
            .filter(document::Column::DispatchId.eq(dispatch.id))
            .filter(document::Column::Id.is_not_in(kept))
            .exec(conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl DispatchRepository for PgDispatchRepository {
    async fn insert(&self, dispatch: &Dispatch) -> DispatchResult<()> {
        let txn = self.db.begin().await?;

        dispatch::Entity::insert(dispatch::ActiveModel::from_domain(dispatch, dispatch.version)?)
            .exec(&txn)
            .await?;
        Self::write_documents(&txn, dispatch).await?;

        txn.commit().await?;
        tracing::info!(dispatch_id = %dispatch.id, "Created dispatch");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DispatchResult<Option<Dispatch>> {
        let Some(model) = dispatch::Entity::find_by_id(id).one(&self.db).await? else {
            return Ok(None);
        };
        Ok(self.hydrate(vec![model]).await?.pop())
    }

    async fn save(&self, dispatch: &Dispatch) -> DispatchResult<i64> {
        let next = dispatch.version + 1;
        let txn = self.db.begin().await?;

        let result = dispatch::Entity::update_many()
            .set(dispatch::ActiveModel::from_domain(dispatch, next)?)
            .filter(dispatch::Column::Id.eq(dispatch.id))
            .filter(dispatch::Column::Version.eq(dispatch.version))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            let exists = dispatch::Entity::find_by_id(dispatch.id)
                .one(&self.db)
                .await?
                .is_some();
            return Err(if exists {
                DispatchError::Conflict(dispatch.id)
            } else {
                DispatchError::NotFound(dispatch.id)
            });
        }

        Self::write_documents(&txn, dispatch).await?;
        txn.commit().await?;

        tracing::debug!(dispatch_id = %dispatch.id, version = next, "Saved dispatch");
        Ok(next)
    }

    async fn find_by_document_reference(&self, key: &str) -> DispatchResult<Vec<Dispatch>> {
        let holders = Query::select()
            .column(document::Column::DispatchId)
            .from(document::Entity)
            .and_where(document::Column::DeletedAt.is_null())
            .cond_where(
                Condition::any()
                    .add(document::Column::Reference.eq(key))
                    .add(document::Column::OriginalDocumentReference.eq(key)),
            )
            .to_owned();

        let models = dispatch::Entity::find()
            .filter(dispatch::Column::Id.in_subquery(holders))
            .order_by_asc(dispatch::Column::Id)
            .all(&self.db)
            .await?;

        self.hydrate(models).await
    }

    async fn find_in_production_with_document_status(
        &self,
        statuses: &[DocumentStatus],
    ) -> DispatchResult<Vec<Dispatch>> {
        let holders = Query::select()
            .column(document::Column::DispatchId)
            .from(document::Entity)
            .and_where(document::Column::DeletedAt.is_null())
            .and_where(document::Column::Status.is_in(statuses.iter().copied()))
            .to_owned();

        let models = dispatch::Entity::find()
            .filter(dispatch::Column::Status.eq(DispatchStatus::InProduction))
            .filter(dispatch::Column::Id.in_subquery(holders))
            .order_by_asc(dispatch::Column::Id)
            .all(&self.db)
            .await?;

        self.hydrate(models).await
    }

    async fn find_distribution_candidates(
        &self,
        finalized_before: DateTime<Utc>,
        after: Option<Uuid>,
        limit: u64,
    ) -> DispatchResult<Vec<Dispatch>> {
        let distributed = [DispatchStatus::Distributed, DispatchStatus::DistributedLocally];
        let unconfirmed = Condition::all()
            .add(dispatch::Column::Status.is_in(distributed))
            .add(dispatch::Column::DistributionConfirmedAt.is_null());
        let unpublished = Condition::all()
            .add(dispatch::Column::Status.is_in(distributed))
            .add(dispatch::Column::DistributionEventPublishedAt.is_null());
        let follow_up_owed = Condition::all()
            .add(dispatch::Column::Status.eq(DispatchStatus::Distributed))
            .add(dispatch::Column::FollowUp.is_not_null())
            .add(Expr::cust("follow_up ->> 'submissionId' IS NULL"));
        let stale = Condition::all()
            .add(dispatch::Column::Status.eq(DispatchStatus::Finalized))
            .add(dispatch::Column::Kind.eq(DispatchKind::Outbound))
            .add(dispatch::Column::FinalizedAt.lt(finalized_before));

        let mut query = dispatch::Entity::find().filter(
            Condition::any()
                .add(unconfirmed)
                .add(unpublished)
                .add(follow_up_owed)
                .add(stale),
        );
        if let Some(after) = after {
            query = query.filter(dispatch::Column::Id.gt(after));
        }

        let models = query
            .order_by_asc(dispatch::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?;

        self.hydrate(models).await
    }
}
