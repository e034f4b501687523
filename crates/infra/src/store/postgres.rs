//! Postgres-backed membership store.
//!
//! Both ledgers live in their own tables (`group_member`,
//! `subject_template_group`); materialized views are computed per query with a
//! `UNION ALL` over the two, grouped by `(subject_pk, group_pk)`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `ConstraintViolation` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Backend` |
//!
//! ## Locking
//!
//! Every mutation takes `SELECT ... FOR UPDATE` on the group's `subject` row
//! before touching either ledger, so writers of one group serialize while
//! different groups proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use warden_core::{
    ContributionKey, DirectRelation, GroupPk, Membership, NewTemplateContribution, Pagination,
    StoredDirectRelation, Subject, SubjectPk, SubjectType, TemplateContribution, TemplateId,
};

use super::r#trait::{
    DirectLedger, MembershipView, StoreError, StoreResult, StoreTransaction, SubjectDirectory,
    TemplateLedger, Transactional,
};

/// Open transaction on a pooled connection. Dropping it rolls back.
pub struct PostgresTransaction {
    inner: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn commit(self) -> StoreResult<()> {
        self.inner
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.inner
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Postgres membership store.
///
/// ## Thread Safety
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share it.
#[derive(Debug, Clone)]
pub struct PostgresMembershipStore {
    pool: Arc<PgPool>,
}

impl PostgresMembershipStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Merged `(subject, group)` rows of both ledgers, restricted by `filter`
/// (a predicate over `subject_pk`/`group_pk` using the caller's parameters).
fn merged_memberships_sql(filter: &str) -> String {
    format!(
        r#"
        SELECT subject_pk, group_pk, MAX(expired_at) AS expired_at, MIN(created_at) AS created_at
        FROM (
            SELECT subject_pk, group_pk, expired_at, created_at FROM group_member WHERE {filter}
            UNION ALL
            SELECT subject_pk, group_pk, expired_at, created_at FROM subject_template_group WHERE {filter}
        ) AS contributing
        GROUP BY subject_pk, group_pk
        "#
    )
}

fn rows_into<T, D>(operation: &str, rows: Vec<PgRow>) -> StoreResult<Vec<D>>
where
    T: for<'r> FromRow<'r, PgRow> + Into<D>,
{
    rows.iter()
        .map(|row| {
            T::from_row(row).map(Into::into).map_err(|e| {
                StoreError::Backend(format!("failed to decode row in {operation}: {e}"))
            })
        })
        .collect()
}

fn subject_rows(operation: &str, rows: Vec<PgRow>) -> StoreResult<Vec<(SubjectPk, Subject)>> {
    rows_into::<SubjectRow, SubjectRow>(operation, rows)?
        .into_iter()
        .map(|row| {
            let subject_type: SubjectType = row.subject_type.parse().map_err(|e| {
                StoreError::Backend(format!("subject {} has invalid type: {e}", row.pk))
            })?;
            Ok((SubjectPk::new(row.pk), Subject::new(subject_type, row.id)))
        })
        .collect()
}

fn pk_arrays(relations: &[DirectRelation]) -> (Vec<i64>, Vec<i64>, Vec<i64>) {
    let subjects = relations.iter().map(|r| r.subject_pk.get()).collect();
    let groups = relations.iter().map(|r| r.group_pk.get()).collect();
    let expiries = relations.iter().map(|r| r.expired_at).collect();
    (subjects, groups, expiries)
}

fn contribution_arrays(
    rows: &[NewTemplateContribution],
) -> (Vec<i64>, Vec<i64>, Vec<i64>, Vec<i64>) {
    let subjects = rows.iter().map(|r| r.subject_pk.get()).collect();
    let templates = rows.iter().map(|r| r.template_id.get()).collect();
    let groups = rows.iter().map(|r| r.group_pk.get()).collect();
    let expiries = rows.iter().map(|r| r.expired_at).collect();
    (subjects, templates, groups, expiries)
}

#[async_trait]
impl Transactional for PostgresMembershipStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> StoreResult<PostgresTransaction> {
        let inner = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTransaction { inner })
    }
}

#[async_trait]
impl SubjectDirectory for PostgresMembershipStore {
    #[instrument(skip(self), fields(subject = %subject), err)]
    async fn get_subject_pk(&self, subject: &Subject) -> StoreResult<Option<SubjectPk>> {
        let pk: Option<i64> = sqlx::query_scalar("SELECT pk FROM subject WHERE type = $1 AND id = $2")
            .bind(subject.subject_type.as_str())
            .bind(&subject.id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_subject_pk", e))?;
        Ok(pk.map(SubjectPk::new))
    }

    #[instrument(
        skip(self, subjects),
        fields(count = subjects.len(), resolved = tracing::field::Empty),
        err
    )]
    async fn list_subject_pks(
        &self,
        subjects: &[Subject],
    ) -> StoreResult<HashMap<Subject, SubjectPk>> {
        if subjects.is_empty() {
            return Ok(HashMap::new());
        }
        let types: Vec<String> = subjects
            .iter()
            .map(|s| s.subject_type.as_str().to_string())
            .collect();
        let ids: Vec<String> = subjects.iter().map(|s| s.id.clone()).collect();

        let rows = sqlx::query(
            r#"
            SELECT s.pk, s.type, s.id
            FROM subject s
            JOIN UNNEST($1::text[], $2::text[]) AS wanted(type, id)
              ON s.type = wanted.type AND s.id = wanted.id
            "#,
        )
        .bind(types)
        .bind(ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_subject_pks", e))?;

        let resolved = subject_rows("list_subject_pks", rows)?;
        Span::current().record("resolved", resolved.len());
        Ok(resolved.into_iter().map(|(pk, s)| (s, pk)).collect())
    }

    #[instrument(skip(self, pks), fields(count = pks.len()), err)]
    async fn list_subjects_by_pks(
        &self,
        pks: &[SubjectPk],
    ) -> StoreResult<HashMap<SubjectPk, Subject>> {
        if pks.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<i64> = pks.iter().map(SubjectPk::get).collect();
        let rows = sqlx::query("SELECT pk, type, id FROM subject WHERE pk = ANY($1)")
            .bind(keys)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_subjects_by_pks", e))?;
        Ok(subject_rows("list_subjects_by_pks", rows)?.into_iter().collect())
    }

    #[instrument(skip(self, tx), fields(group_pk = %group_pk), err)]
    async fn lock_group(&self, tx: &mut PostgresTransaction, group_pk: GroupPk) -> StoreResult<()> {
        let locked: Option<i64> =
            sqlx::query_scalar("SELECT pk FROM subject WHERE pk = $1 AND type = 'group' FOR UPDATE")
                .bind(group_pk.get())
                .fetch_optional(&mut *tx.inner)
                .await
                .map_err(|e| map_sqlx_error("lock_group", e))?;
        locked
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("group {group_pk}")))
    }
}

#[async_trait]
impl DirectLedger for PostgresMembershipStore {
    #[instrument(skip(self, tx, subject_pks), fields(group_pk = %group_pk, count = subject_pks.len()), err)]
    async fn list_members_by_group_subjects(
        &self,
        tx: &mut PostgresTransaction,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
    ) -> StoreResult<Vec<StoredDirectRelation>> {
        if subject_pks.is_empty() {
            return Ok(vec![]);
        }
        let keys: Vec<i64> = subject_pks.iter().map(SubjectPk::get).collect();
        let rows = sqlx::query(
            r#"
            SELECT subject_pk, group_pk, expired_at, created_at
            FROM group_member
            WHERE group_pk = $1 AND subject_pk = ANY($2)
            ORDER BY subject_pk
            "#,
        )
        .bind(group_pk.get())
        .bind(keys)
        .fetch_all(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("list_members_by_group_subjects", e))?;
        rows_into::<MemberRow, _>("list_members_by_group_subjects", rows)
    }

    async fn member_exists(
        &self,
        tx: &mut PostgresTransaction,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> StoreResult<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM group_member WHERE subject_pk = $1 AND group_pk = $2)",
        )
        .bind(subject_pk.get())
        .bind(group_pk.get())
        .fetch_one(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("member_exists", e))
    }

    #[instrument(skip(self, tx, relations), fields(count = relations.len()), err)]
    async fn bulk_upsert_members(
        &self,
        tx: &mut PostgresTransaction,
        relations: &[DirectRelation],
    ) -> StoreResult<()> {
        if relations.is_empty() {
            return Ok(());
        }
        let (subjects, groups, expiries) = pk_arrays(relations);
        sqlx::query(
            r#"
            INSERT INTO group_member (subject_pk, group_pk, expired_at)
            SELECT * FROM UNNEST($1::bigint[], $2::bigint[], $3::bigint[])
            ON CONFLICT (subject_pk, group_pk)
            DO UPDATE SET expired_at = EXCLUDED.expired_at
            "#,
        )
        .bind(subjects)
        .bind(groups)
        .bind(expiries)
        .execute(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("bulk_upsert_members", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx, relations), fields(count = relations.len()), err)]
    async fn bulk_update_member_expired_at(
        &self,
        tx: &mut PostgresTransaction,
        relations: &[DirectRelation],
    ) -> StoreResult<u64> {
        if relations.is_empty() {
            return Ok(0);
        }
        let (subjects, groups, expiries) = pk_arrays(relations);
        let result = sqlx::query(
            r#"
            UPDATE group_member AS m
            SET expired_at = v.expired_at
            FROM UNNEST($1::bigint[], $2::bigint[], $3::bigint[]) AS v(subject_pk, group_pk, expired_at)
            WHERE m.subject_pk = v.subject_pk AND m.group_pk = v.group_pk
            "#,
        )
        .bind(subjects)
        .bind(groups)
        .bind(expiries)
        .execute(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("bulk_update_member_expired_at", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, tx, pairs), fields(count = pairs.len()), err)]
    async fn bulk_delete_members(
        &self,
        tx: &mut PostgresTransaction,
        pairs: &[(SubjectPk, GroupPk)],
    ) -> StoreResult<u64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let subjects: Vec<i64> = pairs.iter().map(|(s, _)| s.get()).collect();
        let groups: Vec<i64> = pairs.iter().map(|(_, g)| g.get()).collect();
        let result = sqlx::query(
            r#"
            DELETE FROM group_member AS m
            USING UNNEST($1::bigint[], $2::bigint[]) AS v(subject_pk, group_pk)
            WHERE m.subject_pk = v.subject_pk AND m.group_pk = v.group_pk
            "#,
        )
        .bind(subjects)
        .bind(groups)
        .execute(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("bulk_delete_members", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(group_pk = %group_pk), err)]
    async fn list_direct_members(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
        pagination: Pagination,
    ) -> StoreResult<Vec<StoredDirectRelation>> {
        let rows = sqlx::query(
            r#"
            SELECT subject_pk, group_pk, expired_at, created_at
            FROM group_member
            WHERE group_pk = $1 AND ($2::bigint IS NULL OR expired_at < $2)
            ORDER BY subject_pk
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(group_pk.get())
        .bind(before)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_direct_members", e))?;
        rows_into::<MemberRow, _>("list_direct_members", rows)
    }

    #[instrument(skip(self), fields(group_pk = %group_pk), err)]
    async fn count_direct_members(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
    ) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM group_member
            WHERE group_pk = $1 AND ($2::bigint IS NULL OR expired_at < $2)
            "#,
        )
        .bind(group_pk.get())
        .bind(before)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_direct_members", e))?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl TemplateLedger for PostgresMembershipStore {
    #[instrument(
        skip(self, tx, subject_pks),
        fields(template_id = %template_id, group_pk = %group_pk, count = subject_pks.len()),
        err
    )]
    async fn list_contributions_by_template_group_subjects(
        &self,
        tx: &mut PostgresTransaction,
        template_id: TemplateId,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
    ) -> StoreResult<Vec<TemplateContribution>> {
        if subject_pks.is_empty() {
            return Ok(vec![]);
        }
        let keys: Vec<i64> = subject_pks.iter().map(SubjectPk::get).collect();
        let rows = sqlx::query(
            r#"
            SELECT pk, subject_pk, template_id, group_pk, expired_at, created_at
            FROM subject_template_group
            WHERE template_id = $1 AND group_pk = $2 AND subject_pk = ANY($3)
            ORDER BY pk
            "#,
        )
        .bind(template_id.get())
        .bind(group_pk.get())
        .bind(keys)
        .fetch_all(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("list_contributions_by_template_group_subjects", e))?;
        rows_into::<ContributionRow, _>("list_contributions_by_template_group_subjects", rows)
    }

    #[instrument(skip(self, tx, rows), fields(count = rows.len()), err)]
    async fn bulk_create_contributions(
        &self,
        tx: &mut PostgresTransaction,
        rows: &[NewTemplateContribution],
    ) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let (subjects, templates, groups, expiries) = contribution_arrays(rows);
        sqlx::query(
            r#"
            INSERT INTO subject_template_group (subject_pk, template_id, group_pk, expired_at)
            SELECT * FROM UNNEST($1::bigint[], $2::bigint[], $3::bigint[], $4::bigint[])
            "#,
        )
        .bind(subjects)
        .bind(templates)
        .bind(groups)
        .bind(expiries)
        .execute(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("bulk_create_contributions", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx, rows), fields(count = rows.len()), err)]
    async fn bulk_update_contribution_expired_at(
        &self,
        tx: &mut PostgresTransaction,
        rows: &[NewTemplateContribution],
    ) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let (subjects, templates, groups, expiries) = contribution_arrays(rows);
        let result = sqlx::query(
            r#"
            UPDATE subject_template_group AS c
            SET expired_at = v.expired_at
            FROM UNNEST($1::bigint[], $2::bigint[], $3::bigint[], $4::bigint[])
                AS v(subject_pk, template_id, group_pk, expired_at)
            WHERE c.subject_pk = v.subject_pk
              AND c.template_id = v.template_id
              AND c.group_pk = v.group_pk
            "#,
        )
        .bind(subjects)
        .bind(templates)
        .bind(groups)
        .bind(expiries)
        .execute(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("bulk_update_contribution_expired_at", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, tx, keys), fields(count = keys.len()), err)]
    async fn bulk_delete_contributions(
        &self,
        tx: &mut PostgresTransaction,
        keys: &[ContributionKey],
    ) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let subjects: Vec<i64> = keys.iter().map(|k| k.subject_pk.get()).collect();
        let templates: Vec<i64> = keys.iter().map(|k| k.template_id.get()).collect();
        let groups: Vec<i64> = keys.iter().map(|k| k.group_pk.get()).collect();
        let result = sqlx::query(
            r#"
            DELETE FROM subject_template_group AS c
            USING UNNEST($1::bigint[], $2::bigint[], $3::bigint[]) AS v(subject_pk, template_id, group_pk)
            WHERE c.subject_pk = v.subject_pk
              AND c.template_id = v.template_id
              AND c.group_pk = v.group_pk
            "#,
        )
        .bind(subjects)
        .bind(templates)
        .bind(groups)
        .execute(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("bulk_delete_contributions", e))?;
        Ok(result.rows_affected())
    }

    async fn has_relation_except_template(
        &self,
        tx: &mut PostgresTransaction,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
        template_id: TemplateId,
    ) -> StoreResult<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM subject_template_group
                WHERE subject_pk = $1 AND group_pk = $2 AND template_id <> $3
            )
            "#,
        )
        .bind(subject_pk.get())
        .bind(group_pk.get())
        .bind(template_id.get())
        .fetch_one(&mut *tx.inner)
        .await
        .map_err(|e| map_sqlx_error("has_relation_except_template", e))
    }

    #[instrument(skip(self), fields(subject_pk = %subject_pk, group_pk = %group_pk), err)]
    async fn get_expired_at_by_subject_group(
        &self,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> StoreResult<i64> {
        let expired_at: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(expired_at) FROM subject_template_group WHERE subject_pk = $1 AND group_pk = $2",
        )
        .bind(subject_pk.get())
        .bind(group_pk.get())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_expired_at_by_subject_group", e))?;
        expired_at.ok_or_else(|| {
            StoreError::NotFound(format!(
                "no template contribution for subject {subject_pk} in group {group_pk}"
            ))
        })
    }

    #[instrument(skip(self), fields(template_id = %template_id), err)]
    async fn list_contributions_by_template(
        &self,
        template_id: TemplateId,
        group_pk: Option<GroupPk>,
    ) -> StoreResult<Vec<TemplateContribution>> {
        let rows = sqlx::query(
            r#"
            SELECT pk, subject_pk, template_id, group_pk, expired_at, created_at
            FROM subject_template_group
            WHERE template_id = $1 AND ($2::bigint IS NULL OR group_pk = $2)
            ORDER BY pk
            "#,
        )
        .bind(template_id.get())
        .bind(group_pk.map(|g| g.get()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_contributions_by_template", e))?;
        rows_into::<ContributionRow, _>("list_contributions_by_template", rows)
    }
}

#[async_trait]
impl MembershipView for PostgresMembershipStore {
    #[instrument(skip(self), fields(group_pk = %group_pk), err)]
    async fn list_group_memberships(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
        pagination: Pagination,
    ) -> StoreResult<Vec<Membership>> {
        let sql = format!(
            "{} HAVING ($2::bigint IS NULL OR MAX(expired_at) < $2) ORDER BY subject_pk LIMIT $3 OFFSET $4",
            merged_memberships_sql("group_pk = $1")
        );
        let rows = sqlx::query(&sql)
            .bind(group_pk.get())
            .bind(before)
            .bind(i64::from(pagination.limit))
            .bind(i64::from(pagination.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_group_memberships", e))?;
        rows_into::<MembershipRow, _>("list_group_memberships", rows)
    }

    #[instrument(skip(self), fields(group_pk = %group_pk), err)]
    async fn count_group_memberships(
        &self,
        group_pk: GroupPk,
        before: Option<i64>,
    ) -> StoreResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM ({} HAVING ($2::bigint IS NULL OR MAX(expired_at) < $2)) AS merged",
            merged_memberships_sql("group_pk = $1")
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(group_pk.get())
            .bind(before)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_group_memberships", e))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), fields(subject_pk = %subject_pk), err)]
    async fn list_subject_memberships(
        &self,
        subject_pk: SubjectPk,
        before: Option<i64>,
    ) -> StoreResult<Vec<Membership>> {
        let sql = format!(
            "{} HAVING ($2::bigint IS NULL OR MAX(expired_at) < $2) ORDER BY group_pk",
            merged_memberships_sql("subject_pk = $1")
        );
        let rows = sqlx::query(&sql)
            .bind(subject_pk.get())
            .bind(before)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_subject_memberships", e))?;
        rows_into::<MembershipRow, _>("list_subject_memberships", rows)
    }

    async fn get_membership(
        &self,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> StoreResult<Option<Membership>> {
        let sql = merged_memberships_sql("subject_pk = $1 AND group_pk = $2");
        let row = sqlx::query(&sql)
            .bind(subject_pk.get())
            .bind(group_pk.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_membership", e))?;
        Ok(rows_into::<MembershipRow, _>("get_membership", row.into_iter().collect())?
            .pop())
    }

    #[instrument(
        skip(self, group_pks),
        fields(count = group_pks.len(), expiring = tracing::field::Empty),
        err
    )]
    async fn filter_groups_with_expiring_members(
        &self,
        group_pks: &[GroupPk],
        before: i64,
    ) -> StoreResult<Vec<GroupPk>> {
        if group_pks.is_empty() {
            return Ok(vec![]);
        }
        let keys: Vec<i64> = group_pks.iter().map(GroupPk::get).collect();
        let sql = format!(
            "SELECT DISTINCT group_pk FROM ({} HAVING MAX(expired_at) < $2) AS expiring ORDER BY group_pk",
            merged_memberships_sql("group_pk = ANY($1)")
        );
        let groups: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(keys)
            .bind(before)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("filter_groups_with_expiring_members", e))?;
        Span::current().record("expiring", groups.len());
        Ok(groups.into_iter().map(GroupPk::new).collect())
    }
}

/// Map SQLx errors to store errors.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => StoreError::ConstraintViolation(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(io) => StoreError::Unavailable(format!("io error in {}: {}", operation, io)),
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

struct SubjectRow {
    pk: i64,
    subject_type: String,
    id: String,
}

impl<'r> FromRow<'r, PgRow> for SubjectRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SubjectRow {
            pk: row.try_get("pk")?,
            subject_type: row.try_get("type")?,
            id: row.try_get("id")?,
        })
    }
}

struct MemberRow {
    subject_pk: i64,
    group_pk: i64,
    expired_at: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for MemberRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MemberRow {
            subject_pk: row.try_get("subject_pk")?,
            group_pk: row.try_get("group_pk")?,
            expired_at: row.try_get("expired_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<MemberRow> for StoredDirectRelation {
    fn from(row: MemberRow) -> Self {
        StoredDirectRelation {
            subject_pk: SubjectPk::new(row.subject_pk),
            group_pk: GroupPk::new(row.group_pk),
            expired_at: row.expired_at,
            created_at: row.created_at,
        }
    }
}

struct ContributionRow {
    pk: i64,
    subject_pk: i64,
    template_id: i64,
    group_pk: i64,
    expired_at: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ContributionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ContributionRow {
            pk: row.try_get("pk")?,
            subject_pk: row.try_get("subject_pk")?,
            template_id: row.try_get("template_id")?,
            group_pk: row.try_get("group_pk")?,
            expired_at: row.try_get("expired_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<ContributionRow> for TemplateContribution {
    fn from(row: ContributionRow) -> Self {
        TemplateContribution {
            pk: row.pk,
            subject_pk: SubjectPk::new(row.subject_pk),
            template_id: TemplateId::new(row.template_id),
            group_pk: GroupPk::new(row.group_pk),
            expired_at: row.expired_at,
            created_at: row.created_at,
        }
    }
}

/// Same columns as [`MemberRow`], produced by the merged query.
struct MembershipRow(MemberRow);

impl<'r> FromRow<'r, PgRow> for MembershipRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        MemberRow::from_row(row).map(MembershipRow)
    }
}

impl From<MembershipRow> for Membership {
    fn from(MembershipRow(row): MembershipRow) -> Self {
        Membership {
            subject_pk: SubjectPk::new(row.subject_pk),
            group_pk: GroupPk::new(row.group_pk),
            expired_at: row.expired_at,
            created_at: row.created_at,
        }
    }
}
