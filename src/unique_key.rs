//! C5 — temporal unique-key enforcer (spec §4.5): a plain `UNIQUE` constraint
//! over `(key columns, valid_from, valid_until)` plus a GiST `EXCLUDE`
//! constraint that rejects overlapping ranges for equal key columns.
//!
//! Declarative and synchronous by design (spec §4.5: "not deferrable: the
//! merge executor is architected to avoid creating temporary overlaps") —
//! unlike `foreign_key.rs` there is no trigger body to write here, only DDL.

use pgrx::prelude::*;

use crate::error::{ObjectRef, SagaError, SagaResult};
use crate::types::{Era, UniqueKey};
use crate::util::{first_free_name, qi, truncate_identifier, MAX_IDENTIFIER_LENGTH};

extension_sql!(
    "CREATE EXTENSION IF NOT EXISTS btree_gist",
    name = "temporal_unique_key_btree_gist",
    requires = ["temporal_catalog_tables"]
);

/// `{table}_{col1}_{col2}_{era}_key`, truncated/disambiguated per
/// `util::first_free_name`.
pub fn generate_key_name(table: &str, column_names: &[String], era_name: &str) -> String {
    let base = format!("{table}_{}_{era_name}_key", column_names.join("_"));
    first_free_name(&base, MAX_IDENTIFIER_LENGTH, |candidate| {
        Spi::get_one::<i64>(&format!(
            "SELECT count(*) FROM temporal.unique_key WHERE key_name = '{}'",
            candidate.replace('\'', "''")
        ))
        .unwrap_or(Some(0))
        .unwrap_or(0)
            > 0
    })
}

/// spec §4.3 step 3 for unique keys: create the backing `UNIQUE` and
/// `EXCLUDE` constraints, returning their names. Existing data is validated
/// by the constraints themselves at creation time (Postgres always validates
/// a new constraint against current rows).
pub fn create_backing_objects(
    schema: &str,
    table: &str,
    column_names: &[String],
    era: &Era,
    predicate: Option<&str>,
) -> SagaResult<(String, String)> {
    let unique_name = truncate_identifier(
        &format!("{table}_{}_unique", column_names.join("_")),
        MAX_IDENTIFIER_LENGTH,
    );
    let exclude_name = truncate_identifier(
        &format!("{table}_{}_excl", column_names.join("_")),
        MAX_IDENTIFIER_LENGTH,
    );

    let unique_cols = column_names
        .iter()
        .map(|c| qi(c))
        .chain([qi(&era.valid_from_column_name), qi(&era.valid_until_column_name)])
        .collect::<Vec<_>>()
        .join(", ");
    let unique_sql = format!(
        "ALTER TABLE {schema}.{tbl} ADD CONSTRAINT {name} UNIQUE ({cols})",
        schema = qi(schema),
        tbl = qi(table),
        name = qi(&unique_name),
        cols = unique_cols,
    );
    Spi::run(&unique_sql).map_err(|e| {
        SagaError::consistency(ObjectRef::table(schema, table), format!("creating unique constraint: {e}"))
    })?;

    let range_expr = format!(
        "{rt}({from}, {until}, '[)')",
        rt = era.range_type,
        from = qi(&era.valid_from_column_name),
        until = qi(&era.valid_until_column_name),
    );
    let exclude_elems = column_names
        .iter()
        .map(|c| format!("{} WITH =", qi(c)))
        .chain([format!("{range_expr} WITH &&")])
        .collect::<Vec<_>>()
        .join(", ");
    let where_clause = predicate
        .map(|p| format!(" WHERE ({p})"))
        .unwrap_or_default();
    let exclude_sql = format!(
        "ALTER TABLE {schema}.{tbl} ADD CONSTRAINT {name} EXCLUDE USING gist ({elems}){wh}",
        schema = qi(schema),
        tbl = qi(table),
        name = qi(&exclude_name),
        elems = exclude_elems,
        wh = where_clause,
    );
    Spi::run(&exclude_sql).map_err(|e| {
        SagaError::integrity(
            exclude_name.as_str(),
            format!("{schema}.{table}"),
            format!("creating exclusion constraint (likely an overlap in existing data): {e}"),
        )
    })?;

    Ok((unique_name, exclude_name))
}

/// Drops the physical `UNIQUE`/`EXCLUDE` constraints backing `uk`. Called by
/// `catalog::drop_unique_key` only when `cleanup` is requested.
pub fn drop_backing_objects(uk: &UniqueKey) -> SagaResult<()> {
    let drop_unique = format!(
        "ALTER TABLE {schema}.{tbl} DROP CONSTRAINT IF EXISTS {name}",
        schema = qi(&uk.table_schema),
        tbl = qi(&uk.table_name),
        name = qi(&uk.unique_constraint),
    );
    Spi::run(&drop_unique).map_err(|e| {
        SagaError::consistency(ObjectRef::table(&uk.table_schema, &uk.table_name), e.to_string())
    })?;

    let drop_exclude = format!(
        "ALTER TABLE {schema}.{tbl} DROP CONSTRAINT IF EXISTS {name}",
        schema = qi(&uk.table_schema),
        tbl = qi(&uk.table_name),
        name = qi(&uk.exclude_constraint),
    );
    Spi::run(&drop_exclude).map_err(|e| {
        SagaError::consistency(ObjectRef::table(&uk.table_schema, &uk.table_name), e.to_string())
    })
}

/// Drops a unique key by name (spec §6 `drop_unique_key(table, key_name|column_set, behavior, cleanup)`).
/// The `behavior`/dependent-FK handling lives in `catalog::drop_unique_key_impl`;
/// this function only removes the catalog row's own backing objects and row.
pub fn drop_unique_key(
    key_name: &str,
    behavior: crate::types::DropBehavior,
    cleanup: bool,
) -> SagaResult<()> {
    crate::catalog::drop_unique_key_impl(key_name, behavior, cleanup)
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use super::*;

    #[pg_test]
    fn test_create_and_drop_backing_objects() {
        Spi::run(
            "CREATE TABLE uk_t1 (id int, valid_from date not null, valid_until date not null)",
        )
        .unwrap();
        let era = Era {
            table_schema: "public".to_string(),
            table_name: "uk_t1".to_string(),
            era_name: "valid".to_string(),
            valid_from_column_name: "valid_from".to_string(),
            valid_until_column_name: "valid_until".to_string(),
            valid_to_column_name: None,
            range_type: "daterange".to_string(),
            multirange_type: "datemultirange".to_string(),
            range_subtype: "date".to_string(),
            range_subtype_category: 'D',
            bounds_check_constraint: None,
            audit_table: None,
            ephemeral_columns: Vec::new(),
        };
        let (unique_name, exclude_name) =
            create_backing_objects("public", "uk_t1", &["id".to_string()], &era, None).unwrap();
        assert!(unique_name.ends_with("_unique"));
        assert!(exclude_name.ends_with("_excl"));

        let uk = UniqueKey {
            key_name: "uk_t1_id_valid_key".to_string(),
            table_schema: "public".to_string(),
            table_name: "uk_t1".to_string(),
            column_names: vec!["id".to_string()],
            era_name: "valid".to_string(),
            unique_constraint: unique_name,
            exclude_constraint: exclude_name,
            predicate: None,
        };
        assert!(drop_backing_objects(&uk).is_ok());
    }
}
