//! Bootstrap DDL for the Postgres membership store.
//!
//! The `subject` table is owned by the identity service; it is created here only
//! so a fresh development database is usable.

/// Statements applied in order by [`crate::db::ensure_schema`]. Each one is
/// idempotent.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS subject (
        pk   BIGSERIAL PRIMARY KEY,
        type VARCHAR(32) NOT NULL,
        id   VARCHAR(64) NOT NULL,
        name VARCHAR(512) NOT NULL DEFAULT '',
        UNIQUE (type, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_member (
        pk         BIGSERIAL PRIMARY KEY,
        subject_pk BIGINT NOT NULL,
        group_pk   BIGINT NOT NULL,
        expired_at BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (subject_pk, group_pk)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_group_member_group_expired
        ON group_member (group_pk, expired_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subject_template_group (
        pk          BIGSERIAL PRIMARY KEY,
        subject_pk  BIGINT NOT NULL,
        template_id BIGINT NOT NULL,
        group_pk    BIGINT NOT NULL,
        expired_at  BIGINT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (subject_pk, template_id, group_pk)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_subject_template_group_group_expired
        ON subject_template_group (group_pk, expired_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_subject_template_group_subject
        ON subject_template_group (subject_pk)
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledgers_carry_their_uniqueness_constraints() {
        let ddl = SCHEMA_STATEMENTS.join("\n");
        assert!(ddl.contains("UNIQUE (subject_pk, group_pk)"));
        assert!(ddl.contains("UNIQUE (subject_pk, template_id, group_pk)"));
        assert!(SCHEMA_STATEMENTS.iter().all(|s| s.contains("IF NOT EXISTS")));
    }
}
