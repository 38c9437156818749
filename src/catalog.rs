//! C3 — durable catalog of eras, temporal unique keys, and temporal foreign
//! keys (spec §4.3), plus the `add_*`/`drop_*` public operations (spec §6).
//!
//! Grounded on `introspect.rs`'s SPI-query-building style (schema-qualified
//! lookups by relation OID) and `util.rs`'s identifier-quoting conventions,
//! applied to catalog *tables* this crate owns rather than read-only
//! metadata views.

use pgrx::prelude::*;

use crate::error::{ObjectRef, SagaError, SagaResult};
use crate::lock::{self, CatalogRelation};
use crate::types::{DropBehavior, Era, FkAction, ForeignKey, MatchMode, UniqueKey};
use crate::util::qi;

extension_sql!(
    r#"
    CREATE SCHEMA IF NOT EXISTS temporal;

    CREATE TABLE temporal.era (
        table_schema text NOT NULL,
        table_name text NOT NULL,
        era_name text NOT NULL,
        valid_from_column_name text NOT NULL,
        valid_until_column_name text NOT NULL,
        valid_to_column_name text,
        range_type text NOT NULL,
        multirange_type text NOT NULL,
        range_subtype text NOT NULL,
        range_subtype_category text NOT NULL,
        bounds_check_constraint text,
        audit_table text,
        ephemeral_columns text[] NOT NULL DEFAULT '{}',
        PRIMARY KEY (table_schema, table_name, era_name)
    );

    CREATE TABLE temporal.unique_key (
        key_name text PRIMARY KEY,
        table_schema text NOT NULL,
        table_name text NOT NULL,
        column_names text[] NOT NULL,
        era_name text NOT NULL,
        unique_constraint text NOT NULL,
        exclude_constraint text NOT NULL,
        predicate text,
        FOREIGN KEY (table_schema, table_name, era_name)
            REFERENCES temporal.era (table_schema, table_name, era_name)
    );

    CREATE TABLE temporal.foreign_key (
        key_name text PRIMARY KEY,
        child_schema text NOT NULL,
        child_table text NOT NULL,
        child_columns text[] NOT NULL,
        child_era_name text NOT NULL,
        parent_key_name text NOT NULL REFERENCES temporal.unique_key (key_name),
        match_mode text NOT NULL,
        on_update text NOT NULL,
        on_delete text NOT NULL,
        insert_trigger text NOT NULL,
        update_trigger text NOT NULL,
        parent_update_trigger text NOT NULL,
        parent_delete_trigger text NOT NULL,
        FOREIGN KEY (child_schema, child_table, child_era_name)
            REFERENCES temporal.era (table_schema, table_name, era_name)
    );
    "#,
    name = "temporal_catalog_tables"
);

/// Postgres type name → (range_type, multirange_type, subtype_category).
/// Mirrors the mapping the teacher reads back out of `sql_saga.era` (see
/// `introspect::introspect_era`'s `range_subtype_category` column) but here
/// runs forward, inferring the range type from a plain column type.
fn infer_range_type(pg_type: &str) -> Option<(&'static str, &'static str, char)> {
    match pg_type {
        "integer" | "int4" => Some(("int4range", "int4multirange", 'N')),
        "bigint" | "int8" => Some(("int8range", "int8multirange", 'N')),
        "numeric" => Some(("numrange", "nummultirange", 'N')),
        "date" => Some(("daterange", "datemultirange", 'D')),
        "timestamp without time zone" => Some(("tsrange", "tsmultirange", 'D')),
        "timestamp with time zone" => Some(("tstzrange", "tstzmultirange", 'D')),
        _ => None,
    }
}

struct ColumnInfo {
    pg_type: String,
    collation: Option<String>,
    not_null: bool,
}

fn column_info(table: pg_sys::Oid, column: &str) -> SagaResult<ColumnInfo> {
    let sql = format!(
        "SELECT format_type(a.atttypid, a.atttypmod), co.collname, a.attnotnull \
         FROM pg_attribute a \
         LEFT JOIN pg_collation co ON co.oid = a.attcollation \
         WHERE a.attrelid = {oid}::oid AND a.attname = '{col}' AND NOT a.attisdropped",
        oid = u32::from(table),
        col = column.replace('\'', "''"),
    );
    Spi::connect(|client| {
        let table_data = client
            .select(&sql, Some(1), &[])
            .map_err(|e| SagaError::argument(format!("introspecting column {column}: {e}")))?;
        let row = table_data.first();
        let pg_type: String = row
            .get::<String>(1)
            .map_err(|e| SagaError::argument(e.to_string()))?
            .ok_or_else(|| SagaError::argument(format!("column \"{column}\" does not exist")))?;
        let collation: Option<String> = row.get::<String>(2).unwrap_or(None);
        let not_null: bool = row.get::<bool>(3).unwrap_or(Some(false)).unwrap_or(false);
        Ok(ColumnInfo {
            pg_type,
            collation,
            not_null,
        })
    })
}

fn resolve_schema_table(table: pg_sys::Oid) -> SagaResult<(String, String)> {
    let sql = format!(
        "SELECT n.nspname::text, c.relname::text FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.oid = {}::oid",
        u32::from(table)
    );
    Spi::connect(|client| {
        let row = client
            .select(&sql, Some(1), &[])
            .map_err(|e| SagaError::argument(e.to_string()))?
            .first();
        let schema: String = row
            .get::<String>(1)
            .map_err(|e| SagaError::argument(e.to_string()))?
            .ok_or_else(|| SagaError::argument("table does not exist".to_string()))?;
        let name: String = row.get::<String>(2).map_err(|e| SagaError::argument(e.to_string()))?.unwrap();
        Ok((schema, name))
    })
}

const RESERVED_ERA_NAMES: &[&str] = &["system_time"];

/// spec §4.3 step 2: validate, then (step 1 logically happens first via the
/// advisory lock acquired by the caller) create the bounds-check constraint
/// and insert the catalog row.
pub fn add_era_impl(
    table: pg_sys::Oid,
    valid_from_col: &str,
    valid_until_col: &str,
    era_name: &str,
    add_bounds_check: bool,
) -> SagaResult<bool> {
    if RESERVED_ERA_NAMES.contains(&era_name) {
        return Err(SagaError::argument(format!(
            "era name \"{era_name}\" is reserved"
        )));
    }
    lock::acquire(CatalogRelation::Era, table).map_err(SagaError::argument)?;

    let (schema, table_name) = resolve_schema_table(table)?;

    let from_info = column_info(table, valid_from_col)?;
    let until_info = column_info(table, valid_until_col)?;
    if from_info.pg_type != until_info.pg_type {
        return Err(SagaError::type_mismatch(
            ObjectRef::table(&schema, &table_name),
            format!(
                "{valid_from_col} is {} but {valid_until_col} is {}",
                from_info.pg_type, until_info.pg_type
            ),
        ));
    }
    if from_info.collation != until_info.collation {
        return Err(SagaError::type_mismatch(
            ObjectRef::table(&schema, &table_name),
            format!("{valid_from_col} and {valid_until_col} have different collations"),
        ));
    }
    if !from_info.not_null || !until_info.not_null {
        return Err(SagaError::argument(format!(
            "{valid_from_col} and {valid_until_col} must both be NOT NULL"
        )));
    }

    let (range_type, multirange_type, category) = infer_range_type(&from_info.pg_type)
        .ok_or_else(|| SagaError::type_mismatch(ObjectRef::table(&schema, &table_name), format!(
            "no known range type for column type {}", from_info.pg_type
        )))?;

    let bounds_check_name = format!("{table_name}_{era_name}_check");
    if add_bounds_check {
        let sql = format!(
            "ALTER TABLE {schema}.{tbl} ADD CONSTRAINT {constraint} CHECK ({from} < {until})",
            schema = qi(&schema),
            tbl = qi(&table_name),
            constraint = qi(&bounds_check_name),
            from = qi(valid_from_col),
            until = qi(valid_until_col),
        );
        Spi::run(&sql).map_err(|e| {
            SagaError::consistency(ObjectRef::table(&schema, &table_name), e.to_string())
        })?;
    }

    insert_era(&Era {
        table_schema: schema.clone(),
        table_name: table_name.clone(),
        era_name: era_name.to_string(),
        valid_from_column_name: valid_from_col.to_string(),
        valid_until_column_name: valid_until_col.to_string(),
        valid_to_column_name: None,
        range_type: range_type.to_string(),
        multirange_type: multirange_type.to_string(),
        range_subtype: from_info.pg_type,
        range_subtype_category: category,
        bounds_check_constraint: add_bounds_check.then(|| bounds_check_name),
        audit_table: None,
        ephemeral_columns: Vec::new(),
    })?;

    crate::lifecycle::remember_table(u32::from(table), &schema, &table_name);
    crate::lifecycle::remember_column(u32::from(table), column_attnum(table, valid_from_col), valid_from_col);
    crate::lifecycle::remember_column(u32::from(table), column_attnum(table, valid_until_col), valid_until_col);

    Ok(true)
}

fn column_attnum(table: pg_sys::Oid, column: &str) -> i16 {
    let sql = format!(
        "SELECT attnum FROM pg_attribute WHERE attrelid = {}::oid AND attname = '{}'",
        u32::from(table),
        column.replace('\'', "''"),
    );
    Spi::get_one::<i16>(&sql).unwrap_or(Some(0)).unwrap_or(0)
}

fn insert_era(era: &Era) -> SagaResult<()> {
    let sql = format!(
        "INSERT INTO temporal.era (table_schema, table_name, era_name, valid_from_column_name, \
         valid_until_column_name, range_type, multirange_type, range_subtype, \
         range_subtype_category, bounds_check_constraint) \
         VALUES ('{schema}', '{table}', '{era}', '{from}', '{until}', '{rt}', '{mrt}', '{st}', '{cat}', {bc})",
        schema = era.table_schema.replace('\'', "''"),
        table = era.table_name.replace('\'', "''"),
        era = era.era_name.replace('\'', "''"),
        from = era.valid_from_column_name.replace('\'', "''"),
        until = era.valid_until_column_name.replace('\'', "''"),
        rt = era.range_type,
        mrt = era.multirange_type,
        st = era.range_subtype,
        cat = era.range_subtype_category,
        bc = era
            .bounds_check_constraint
            .as_ref()
            .map(|c| format!("'{}'", c.replace('\'', "''")))
            .unwrap_or_else(|| "NULL".to_string()),
    );
    Spi::run(&sql).map_err(|e| SagaError::consistency(
        ObjectRef::table(&era.table_schema, &era.table_name),
        format!("inserting era catalog row: {e}"),
    ))
}

/// spec §4.3 `drop_era`: RESTRICT refuses if unique keys still reference the
/// era; CASCADE drops them (and their dependent foreign keys) first.
pub fn drop_era_impl(
    table: pg_sys::Oid,
    era_name: &str,
    behavior: DropBehavior,
    cleanup: bool,
) -> SagaResult<bool> {
    lock::acquire(CatalogRelation::Era, table).map_err(SagaError::argument)?;
    let (schema, table_name) = resolve_schema_table(table)?;

    let dependents = count_unique_keys_for_era(&schema, &table_name, era_name)?;
    if dependents > 0 {
        if behavior == DropBehavior::Restrict {
            return Err(SagaError::dependency(
                ObjectRef::table(&schema, &table_name),
                format!("{dependents} unique key(s) still reference era \"{era_name}\""),
            ));
        }
        cascade_drop_unique_keys_for_era(&schema, &table_name, era_name, cleanup)?;
    }

    if cleanup {
        if let Some(bounds_check) = bounds_check_constraint(&schema, &table_name, era_name)? {
            let sql = format!(
                "ALTER TABLE {schema}.{tbl} DROP CONSTRAINT IF EXISTS {c}",
                schema = qi(&schema),
                tbl = qi(&table_name),
                c = qi(&bounds_check),
            );
            Spi::run(&sql).map_err(|e| SagaError::consistency(ObjectRef::table(&schema, &table_name), e.to_string()))?;
        }
    }

    let sql = format!(
        "DELETE FROM temporal.era WHERE table_schema = '{s}' AND table_name = '{t}' AND era_name = '{e}'",
        s = schema.replace('\'', "''"),
        t = table_name.replace('\'', "''"),
        e = era_name.replace('\'', "''"),
    );
    Spi::run(&sql).map_err(|e| SagaError::consistency(ObjectRef::table(&schema, &table_name), e.to_string()))?;
    Ok(true)
}

fn count_unique_keys_for_era(schema: &str, table: &str, era_name: &str) -> SagaResult<i64> {
    let sql = format!(
        "SELECT count(*) FROM temporal.unique_key \
         WHERE table_schema = '{s}' AND table_name = '{t}' AND era_name = '{e}'",
        s = schema.replace('\'', "''"),
        t = table.replace('\'', "''"),
        e = era_name.replace('\'', "''"),
    );
    Spi::get_one::<i64>(&sql)
        .map_err(|e| SagaError::consistency(ObjectRef::table(schema, table), e.to_string()))
        .map(|v| v.unwrap_or(0))
}

fn cascade_drop_unique_keys_for_era(
    schema: &str,
    table: &str,
    era_name: &str,
    cleanup: bool,
) -> SagaResult<()> {
    let sql = format!(
        "SELECT key_name FROM temporal.unique_key \
         WHERE table_schema = '{s}' AND table_name = '{t}' AND era_name = '{e}'",
        s = schema.replace('\'', "''"),
        t = table.replace('\'', "''"),
        e = era_name.replace('\'', "''"),
    );
    let key_names: Vec<String> = Spi::connect(|client| {
        client
            .select(&sql, None, &[])
            .map(|t| {
                t.into_iter()
                    .filter_map(|r| r.get::<String>(1).ok().flatten())
                    .collect()
            })
            .unwrap_or_default()
    });
    for key_name in key_names {
        crate::unique_key::drop_unique_key(&key_name, DropBehavior::Cascade, cleanup)?;
    }
    Ok(())
}

fn bounds_check_constraint(schema: &str, table: &str, era_name: &str) -> SagaResult<Option<String>> {
    let sql = format!(
        "SELECT bounds_check_constraint FROM temporal.era \
         WHERE table_schema = '{s}' AND table_name = '{t}' AND era_name = '{e}'",
        s = schema.replace('\'', "''"),
        t = table.replace('\'', "''"),
        e = era_name.replace('\'', "''"),
    );
    Spi::get_one::<String>(&sql)
        .map_err(|e| SagaError::consistency(ObjectRef::table(schema, table), e.to_string()))
}

/// spec §6 `add_unique_key`: validate, then delegate constraint creation to
/// `unique_key::create_backing_objects` and insert the catalog row.
pub fn add_unique_key_impl(
    table: pg_sys::Oid,
    column_names: Vec<String>,
    era_name: &str,
    key_name: Option<String>,
    predicate: Option<String>,
) -> SagaResult<String> {
    lock::acquire(CatalogRelation::UniqueKey, table).map_err(SagaError::argument)?;
    let (schema, table_name) = resolve_schema_table(table)?;
    let era = find_era(&schema, &table_name, era_name)?;

    for col in &column_names {
        if era.valid_from_column_name == *col || era.valid_until_column_name == *col {
            return Err(SagaError::argument(format!(
                "key column \"{col}\" is an era column"
            )));
        }
    }

    let key_name = key_name.unwrap_or_else(|| {
        crate::unique_key::generate_key_name(&table_name, &column_names, era_name)
    });

    let (unique_constraint, exclude_constraint) =
        crate::unique_key::create_backing_objects(&schema, &table_name, &column_names, &era, predicate.as_deref())?;

    let uk = UniqueKey {
        key_name: key_name.clone(),
        table_schema: schema,
        table_name,
        column_names,
        era_name: era_name.to_string(),
        unique_constraint,
        exclude_constraint,
        predicate,
    };
    insert_unique_key(&uk)?;
    Ok(key_name)
}

fn insert_unique_key(uk: &UniqueKey) -> SagaResult<()> {
    let sql = format!(
        "INSERT INTO temporal.unique_key (key_name, table_schema, table_name, column_names, \
         era_name, unique_constraint, exclude_constraint, predicate) \
         VALUES ('{kn}', '{s}', '{t}', ARRAY[{cols}]::text[], '{e}', '{uc}', '{ec}', {pred})",
        kn = uk.key_name.replace('\'', "''"),
        s = uk.table_schema.replace('\'', "''"),
        t = uk.table_name.replace('\'', "''"),
        cols = uk
            .column_names
            .iter()
            .map(|c| format!("'{}'", c.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", "),
        e = uk.era_name.replace('\'', "''"),
        uc = uk.unique_constraint.replace('\'', "''"),
        ec = uk.exclude_constraint.replace('\'', "''"),
        pred = uk
            .predicate
            .as_ref()
            .map(|p| format!("'{}'", p.replace('\'', "''")))
            .unwrap_or_else(|| "NULL".to_string()),
    );
    Spi::run(&sql).map_err(|e| SagaError::consistency(ObjectRef::table(&uk.table_schema, &uk.table_name), e.to_string()))
}

pub fn find_era(schema: &str, table: &str, era_name: &str) -> SagaResult<Era> {
    let sql = format!(
        "SELECT valid_from_column_name, valid_until_column_name, valid_to_column_name, \
         range_type, multirange_type, range_subtype, range_subtype_category, \
         bounds_check_constraint, audit_table, ephemeral_columns \
         FROM temporal.era WHERE table_schema = '{s}' AND table_name = '{t}' AND era_name = '{e}'",
        s = schema.replace('\'', "''"),
        t = table.replace('\'', "''"),
        e = era_name.replace('\'', "''"),
    );
    Spi::connect(|client| {
        let rows = client
            .select(&sql, Some(1), &[])
            .map_err(|e| SagaError::argument(e.to_string()))?;
        if rows.is_empty() {
            return Err(SagaError::argument(format!(
                "no era named \"{era_name}\" on {schema}.{table}"
            )));
        }
        let row = rows.first();
        let cat: String = row.get::<String>(7).unwrap_or(None).unwrap_or_default();
        Ok(Era {
            table_schema: schema.to_string(),
            table_name: table.to_string(),
            era_name: era_name.to_string(),
            valid_from_column_name: row.get::<String>(1).unwrap_or(None).unwrap_or_default(),
            valid_until_column_name: row.get::<String>(2).unwrap_or(None).unwrap_or_default(),
            valid_to_column_name: row.get::<String>(3).unwrap_or(None),
            range_type: row.get::<String>(4).unwrap_or(None).unwrap_or_default(),
            multirange_type: row.get::<String>(5).unwrap_or(None).unwrap_or_default(),
            range_subtype: row.get::<String>(6).unwrap_or(None).unwrap_or_default(),
            range_subtype_category: cat.chars().next().unwrap_or(' '),
            bounds_check_constraint: row.get::<String>(8).unwrap_or(None),
            audit_table: row.get::<String>(9).unwrap_or(None),
            ephemeral_columns: row.get::<Vec<String>>(10).unwrap_or(None).unwrap_or_default(),
        })
    })
}

/// spec §6 `add_foreign_key`: validate column/type correspondence against the
/// parent unique key, then delegate trigger creation to
/// `foreign_key::create_triggers`.
pub fn add_foreign_key_impl(
    child_table: pg_sys::Oid,
    child_columns: Vec<String>,
    child_era_name: &str,
    parent_key_name: &str,
    match_mode: MatchMode,
    on_update: FkAction,
    on_delete: FkAction,
    key_name: Option<String>,
) -> SagaResult<String> {
    if match_mode == MatchMode::Partial {
        return Err(SagaError::argument("MATCH PARTIAL is reserved and not implemented".to_string()));
    }

    lock::acquire(CatalogRelation::ForeignKey, child_table).map_err(SagaError::argument)?;
    let (child_schema, child_table_name) = resolve_schema_table(child_table)?;
    let child_era = find_era(&child_schema, &child_table_name, child_era_name)?;

    let parent_uk = find_unique_key(parent_key_name)?;
    if parent_uk.column_names.len() != child_columns.len() {
        return Err(SagaError::argument(format!(
            "foreign key has {} column(s) but parent key \"{parent_key_name}\" has {}",
            child_columns.len(),
            parent_uk.column_names.len()
        )));
    }
    let parent_era = find_era(&parent_uk.table_schema, &parent_uk.table_name, &parent_uk.era_name)?;
    if parent_era.range_type != child_era.range_type {
        return Err(SagaError::type_mismatch(
            ObjectRef::table(&child_schema, &child_table_name),
            format!(
                "child era range type {} does not match parent era range type {}",
                child_era.range_type, parent_era.range_type
            ),
        ));
    }
    for (child_col, parent_col) in child_columns.iter().zip(parent_uk.column_names.iter()) {
        let c = column_info(child_table, child_col)?;
        let p_oid = resolve_oid(&parent_uk.table_schema, &parent_uk.table_name)?;
        let p = column_info(p_oid, parent_col)?;
        if c.pg_type != p.pg_type || c.collation != p.collation {
            return Err(SagaError::type_mismatch(
                ObjectRef::table(&child_schema, &child_table_name),
                format!("{child_col} does not match parent column {parent_col}"),
            ));
        }
    }

    let key_name = key_name.unwrap_or_else(|| {
        crate::unique_key::generate_key_name(&child_table_name, &child_columns, child_era_name) + "_fkey"
    });

    let triggers = crate::foreign_key::create_triggers(
        &child_schema,
        &child_table_name,
        &child_columns,
        &child_era,
        &parent_uk,
        match_mode,
        &key_name,
    )?;

    let fk = ForeignKey {
        key_name: key_name.clone(),
        child_schema,
        child_table: child_table_name,
        child_columns,
        child_era_name: child_era_name.to_string(),
        parent_key_name: parent_key_name.to_string(),
        match_mode,
        on_update,
        on_delete,
        insert_trigger: triggers.insert_trigger,
        update_trigger: triggers.update_trigger,
        parent_update_trigger: triggers.parent_update_trigger,
        parent_delete_trigger: triggers.parent_delete_trigger,
    };
    insert_foreign_key(&fk)?;
    Ok(key_name)
}

fn resolve_oid(schema: &str, table: &str) -> SagaResult<pg_sys::Oid> {
    let sql = format!(
        "SELECT {}.{}::regclass::oid",
        qi(schema),
        qi(table)
    );
    Spi::get_one::<pg_sys::Oid>(&sql)
        .map_err(|e| SagaError::argument(e.to_string()))?
        .ok_or_else(|| SagaError::argument(format!("table {schema}.{table} does not exist")))
}

fn insert_foreign_key(fk: &ForeignKey) -> SagaResult<()> {
    let sql = format!(
        "INSERT INTO temporal.foreign_key (key_name, child_schema, child_table, child_columns, \
         child_era_name, parent_key_name, match_mode, on_update, on_delete, insert_trigger, \
         update_trigger, parent_update_trigger, parent_delete_trigger) \
         VALUES ('{kn}', '{cs}', '{ct}', ARRAY[{cols}]::text[], '{e}', '{pk}', '{mm}', '{ou}', '{od}', '{it}', '{ut}', '{put}', '{pdt}')",
        kn = fk.key_name.replace('\'', "''"),
        cs = fk.child_schema.replace('\'', "''"),
        ct = fk.child_table.replace('\'', "''"),
        cols = fk
            .child_columns
            .iter()
            .map(|c| format!("'{}'", c.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", "),
        e = fk.child_era_name.replace('\'', "''"),
        pk = fk.parent_key_name.replace('\'', "''"),
        mm = fk.match_mode.as_str(),
        ou = fk.on_update.as_str(),
        od = fk.on_delete.as_str(),
        it = fk.insert_trigger.replace('\'', "''"),
        ut = fk.update_trigger.replace('\'', "''"),
        put = fk.parent_update_trigger.replace('\'', "''"),
        pdt = fk.parent_delete_trigger.replace('\'', "''"),
    );
    Spi::run(&sql).map_err(|e| SagaError::consistency(ObjectRef::table(&fk.child_schema, &fk.child_table), e.to_string()))
}

pub fn find_unique_key(key_name: &str) -> SagaResult<UniqueKey> {
    let sql = format!(
        "SELECT table_schema, table_name, column_names, era_name, unique_constraint, \
         exclude_constraint, predicate FROM temporal.unique_key WHERE key_name = '{}'",
        key_name.replace('\'', "''")
    );
    Spi::connect(|client| {
        let rows = client
            .select(&sql, Some(1), &[])
            .map_err(|e| SagaError::argument(e.to_string()))?;
        if rows.is_empty() {
            return Err(SagaError::argument(format!("no unique key named \"{key_name}\"")));
        }
        let row = rows.first();
        Ok(UniqueKey {
            key_name: key_name.to_string(),
            table_schema: row.get::<String>(1).unwrap_or(None).unwrap_or_default(),
            table_name: row.get::<String>(2).unwrap_or(None).unwrap_or_default(),
            column_names: row.get::<Vec<String>>(3).unwrap_or(None).unwrap_or_default(),
            era_name: row.get::<String>(4).unwrap_or(None).unwrap_or_default(),
            unique_constraint: row.get::<String>(5).unwrap_or(None).unwrap_or_default(),
            exclude_constraint: row.get::<String>(6).unwrap_or(None).unwrap_or_default(),
            predicate: row.get::<String>(7).unwrap_or(None),
        })
    })
}

pub fn find_foreign_key(key_name: &str) -> SagaResult<ForeignKey> {
    let sql = format!(
        "SELECT child_schema, child_table, child_columns, child_era_name, parent_key_name, \
         match_mode, on_update, on_delete, insert_trigger, update_trigger, \
         parent_update_trigger, parent_delete_trigger \
         FROM temporal.foreign_key WHERE key_name = '{}'",
        key_name.replace('\'', "''")
    );
    Spi::connect(|client| {
        let rows = client
            .select(&sql, Some(1), &[])
            .map_err(|e| SagaError::argument(e.to_string()))?;
        if rows.is_empty() {
            return Err(SagaError::argument(format!("no foreign key named \"{key_name}\"")));
        }
        let row = rows.first();
        let match_mode = row
            .get::<String>(6)
            .unwrap_or(None)
            .and_then(|s| MatchMode::from_str(&s))
            .unwrap_or(MatchMode::Simple);
        let on_update = row
            .get::<String>(7)
            .unwrap_or(None)
            .and_then(|s| FkAction::from_str(&s))
            .unwrap_or(FkAction::NoAction);
        let on_delete = row
            .get::<String>(8)
            .unwrap_or(None)
            .and_then(|s| FkAction::from_str(&s))
            .unwrap_or(FkAction::NoAction);
        Ok(ForeignKey {
            key_name: key_name.to_string(),
            child_schema: row.get::<String>(1).unwrap_or(None).unwrap_or_default(),
            child_table: row.get::<String>(2).unwrap_or(None).unwrap_or_default(),
            child_columns: row.get::<Vec<String>>(3).unwrap_or(None).unwrap_or_default(),
            child_era_name: row.get::<String>(4).unwrap_or(None).unwrap_or_default(),
            parent_key_name: row.get::<String>(5).unwrap_or(None).unwrap_or_default(),
            match_mode,
            on_update,
            on_delete,
            insert_trigger: row.get::<String>(9).unwrap_or(None).unwrap_or_default(),
            update_trigger: row.get::<String>(10).unwrap_or(None).unwrap_or_default(),
            parent_update_trigger: row.get::<String>(11).unwrap_or(None).unwrap_or_default(),
            parent_delete_trigger: row.get::<String>(12).unwrap_or(None).unwrap_or_default(),
        })
    })
}

/// spec §6 `drop_unique_key`: RESTRICT refuses if foreign keys still
/// reference it; CASCADE drops those first.
pub fn drop_unique_key_impl(key_name: &str, behavior: DropBehavior, cleanup: bool) -> SagaResult<()> {
    let uk = find_unique_key(key_name)?;
    lock::acquire(CatalogRelation::UniqueKey, resolve_oid(&uk.table_schema, &uk.table_name)?)
        .map_err(SagaError::argument)?;

    let dependents_sql = format!(
        "SELECT key_name FROM temporal.foreign_key WHERE parent_key_name = '{}'",
        key_name.replace('\'', "''")
    );
    let dependents: Vec<String> = Spi::connect(|client| {
        client
            .select(&dependents_sql, None, &[])
            .map(|t| t.into_iter().filter_map(|r| r.get::<String>(1).ok().flatten()).collect())
            .unwrap_or_default()
    });

    if !dependents.is_empty() {
        if behavior == DropBehavior::Restrict {
            return Err(SagaError::dependency(
                ObjectRef::constraint(&uk.table_name, key_name),
                format!("{} foreign key(s) still reference this key", dependents.len()),
            ));
        }
        for fk_name in &dependents {
            crate::foreign_key::drop_foreign_key(fk_name, cleanup)?;
        }
    }

    if cleanup {
        crate::unique_key::drop_backing_objects(&uk)?;
    }

    let sql = format!("DELETE FROM temporal.unique_key WHERE key_name = '{}'", key_name.replace('\'', "''"));
    Spi::run(&sql).map_err(|e| SagaError::consistency(ObjectRef::constraint(&uk.table_name, key_name), e.to_string()))
}

/// spec §6 `drop_foreign_key`.
pub fn drop_foreign_key_impl(key_name: &str, cleanup: bool) -> SagaResult<bool> {
    crate::foreign_key::drop_foreign_key(key_name, cleanup)?;
    Ok(true)
}

// ── SQL-callable public API (spec §6 "Public procedural API") ──
//
// Thin `#[pg_extern]` wrappers around the functions above: parse the
// string-typed enum arguments, then hand errors to `pgrx::error!` so they
// surface as ordinary Postgres ERRORs rather than a panic unwind.

#[pg_extern]
fn add_era(
    table: pg_sys::Oid,
    valid_from_col: &str,
    valid_until_col: &str,
    era_name: default!(&str, "'valid'"),
    add_bounds_check: default!(bool, true),
) -> bool {
    add_era_impl(table, valid_from_col, valid_until_col, era_name, add_bounds_check)
        .unwrap_or_else(|e| pgrx::error!("{}", e))
}

#[pg_extern]
fn drop_era(
    table: pg_sys::Oid,
    era_name: default!(&str, "'valid'"),
    behavior: default!(&str, "'RESTRICT'"),
    cleanup: default!(bool, true),
) -> bool {
    let behavior = DropBehavior::from_str(behavior)
        .unwrap_or_else(|| pgrx::error!("Invalid drop behavior: {}", behavior));
    drop_era_impl(table, era_name, behavior, cleanup).unwrap_or_else(|e| pgrx::error!("{}", e))
}

#[pg_extern]
fn add_unique_key(
    table: pg_sys::Oid,
    key_columns: Vec<String>,
    era_name: default!(&str, "'valid'"),
    key_name: Option<String>,
    predicate: Option<String>,
) -> String {
    add_unique_key_impl(table, key_columns, era_name, key_name, predicate)
        .unwrap_or_else(|e| pgrx::error!("{}", e))
}

#[pg_extern]
fn drop_unique_key(
    key_name: &str,
    behavior: default!(&str, "'RESTRICT'"),
    cleanup: default!(bool, true),
) {
    let behavior = DropBehavior::from_str(behavior)
        .unwrap_or_else(|| pgrx::error!("Invalid drop behavior: {}", behavior));
    drop_unique_key_impl(key_name, behavior, cleanup).unwrap_or_else(|e| pgrx::error!("{}", e))
}

#[pg_extern]
#[allow(clippy::too_many_arguments)]
fn add_foreign_key(
    child_table: pg_sys::Oid,
    child_columns: Vec<String>,
    child_era_name: &str,
    parent_key_name: &str,
    match_mode: default!(&str, "'SIMPLE'"),
    on_update: default!(&str, "'NO ACTION'"),
    on_delete: default!(&str, "'NO ACTION'"),
    key_name: Option<String>,
) -> String {
    let match_mode = MatchMode::from_str(match_mode)
        .unwrap_or_else(|| pgrx::error!("Invalid match mode: {}", match_mode));
    let on_update = FkAction::from_str(on_update)
        .unwrap_or_else(|| pgrx::error!("Invalid on_update action: {}", on_update));
    let on_delete = FkAction::from_str(on_delete)
        .unwrap_or_else(|| pgrx::error!("Invalid on_delete action: {}", on_delete));
    add_foreign_key_impl(
        child_table,
        child_columns,
        child_era_name,
        parent_key_name,
        match_mode,
        on_update,
        on_delete,
        key_name,
    )
    .unwrap_or_else(|e| pgrx::error!("{}", e))
}

#[pg_extern]
fn drop_foreign_key(key_name: &str, cleanup: default!(bool, true)) -> bool {
    drop_foreign_key_impl(key_name, cleanup).unwrap_or_else(|e| pgrx::error!("{}", e))
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use super::*;

    #[pg_test]
    fn test_add_era_rejects_reserved_name() {
        Spi::run("CREATE TABLE cat_t1 (id int, valid_from date not null, valid_until date not null)").unwrap();
        let oid = Spi::get_one::<pg_sys::Oid>("SELECT 'cat_t1'::regclass::oid").unwrap().unwrap();
        let result = add_era(oid, "valid_from", "valid_until", "system_time", true);
        assert!(result.is_err());
    }

    #[pg_test]
    fn test_add_era_creates_catalog_row() {
        Spi::run("CREATE TABLE cat_t2 (id int, valid_from date not null, valid_until date not null)").unwrap();
        let oid = Spi::get_one::<pg_sys::Oid>("SELECT 'cat_t2'::regclass::oid").unwrap().unwrap();
        let result = add_era(oid, "valid_from", "valid_until", "valid", true);
        assert!(result.is_ok());
        let count = Spi::get_one::<i64>(
            "SELECT count(*) FROM temporal.era WHERE table_name = 'cat_t2' AND era_name = 'valid'",
        )
        .unwrap()
        .unwrap();
        assert_eq!(count, 1);
    }
}
