//! C6 — temporal foreign-key validator (spec §4.6). Validation itself runs
//! as plpgsql constraint-trigger bodies (deferrable, so multi-statement
//! reshapes can transiently open a gap); each body delegates the actual
//! coverage check to one of the two `#[pg_extern]` functions below, which
//! resolve and cache constraint metadata per-connection, keyed by constraint
//! name, invalidated only by process restart (spec §9: "per-connection cache
//! with explicit init/teardown").

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use pgrx::prelude::*;

use crate::error::{ObjectRef, SagaError, SagaResult};
use crate::types::{Era, ForeignKey, MatchMode, UniqueKey};
use crate::util::{qi, truncate_identifier, MAX_IDENTIFIER_LENGTH};

/// Resolved, constraint-name-keyed metadata needed to validate one foreign
/// key, cached so that repeated trigger fires pay no catalog-lookup cost
/// (spec §4.6: "cached on first fire; the query text depends only on catalog
/// metadata, not per-row data").
#[derive(Debug, Clone)]
struct FkCacheEntry {
    child_schema: String,
    child_table: String,
    child_columns: Vec<String>,
    child_valid_from: String,
    child_valid_until: String,
    parent_schema: String,
    parent_table: String,
    parent_columns: Vec<String>,
    parent_valid_from: String,
    parent_valid_until: String,
    range_type: String,
    is_numeric: bool,
    domain_code: i32,
    match_mode: MatchMode,
}

thread_local! {
    static FK_CACHE: RefCell<HashMap<u64, FkCacheEntry>> = RefCell::new(HashMap::new());
}

fn cache_key(key_name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key_name.hash(&mut hasher);
    hasher.finish()
}

fn domain_code_for_category(category: char) -> i32 {
    match category {
        'N' => 1,
        'D' => 2,
        _ => 0,
    }
}

fn load_entry(key_name: &str) -> SagaResult<FkCacheEntry> {
    let fk = crate::catalog::find_foreign_key(key_name)?;
    let parent_uk = crate::catalog::find_unique_key(&fk.parent_key_name)?;
    let child_era = crate::catalog::find_era(&fk.child_schema, &fk.child_table, &fk.child_era_name)?;
    let parent_era = crate::catalog::find_era(&parent_uk.table_schema, &parent_uk.table_name, &parent_uk.era_name)?;
    Ok(FkCacheEntry {
        child_schema: fk.child_schema,
        child_table: fk.child_table,
        child_columns: fk.child_columns,
        child_valid_from: child_era.valid_from_column_name,
        child_valid_until: child_era.valid_until_column_name,
        parent_schema: parent_uk.table_schema,
        parent_table: parent_uk.table_name,
        parent_columns: parent_uk.column_names,
        parent_valid_from: parent_era.valid_from_column_name,
        parent_valid_until: parent_era.valid_until_column_name,
        range_type: parent_era.range_type,
        is_numeric: parent_era.range_subtype_category == 'N',
        domain_code: domain_code_for_category(parent_era.range_subtype_category),
        match_mode: fk.match_mode,
    })
}

fn with_entry<T>(key_name: &str, f: impl FnOnce(&FkCacheEntry) -> T) -> SagaResult<T> {
    let key = cache_key(key_name);
    let cached = FK_CACHE.with(|c| c.borrow().get(&key).cloned());
    let entry = match cached {
        Some(e) => e,
        None => {
            let e = load_entry(key_name)?;
            FK_CACHE.with(|c| c.borrow_mut().insert(key, e.clone()));
            e
        }
    };
    Ok(f(&entry))
}

/// Evicts a constraint's cached metadata. Called by `catalog::drop_foreign_key`
/// and by `lifecycle.rs` on rename-following, so a stale cache never outlives
/// the catalog row it describes.
pub fn invalidate(key_name: &str) {
    let key = cache_key(key_name);
    FK_CACHE.with(|c| {
        c.borrow_mut().remove(&key);
    });
}

/// Validates that `key_values` (the child row's referenced columns, as text)
/// over `[child_from, child_until)` is covered by the parent rows sharing
/// that key, per the constraint's match mode (spec §4.6). Called from the
/// plpgsql child insert/update trigger body.
#[pg_extern]
fn temporal_fk_check_child(
    key_name: &str,
    key_values: Vec<Option<String>>,
    child_from: &str,
    child_until: &str,
) -> bool {
    with_entry(key_name, |entry| -> SagaResult<bool> {
        match classify_nulls(&key_values, entry.match_mode) {
            NullOutcome::AcceptNoCheck => Ok(true),
            NullOutcome::MixedNullError => Err(SagaError::integrity(
                "MATCH FULL",
                ObjectRef::table(&entry.child_schema, &entry.child_table),
                format!("foreign key \"{key_name}\" requires all or none of the key columns to be NULL"),
            )),
            NullOutcome::MustCheck => {
                if check_coverage(entry, &key_values, child_from, child_until) {
                    Ok(true)
                } else {
                    Err(SagaError::integrity(
                        "FOREIGN_KEY_VIOLATION",
                        ObjectRef::table(&entry.child_schema, &entry.child_table),
                        format!(
                            "foreign key \"{key_name}\": row {} is not covered by parent \"{}\".\"{}\"",
                            crate::error::fmt_interval(child_from, child_until),
                            entry.parent_schema,
                            entry.parent_table,
                        ),
                    ))
                }
            }
        }
    })
    .and_then(|r| r)
    .unwrap_or_else(raise_violation)
}

/// Re-validates every child row currently pointing at `key_values` on the
/// parent side, used after a parent update/delete of referenced columns
/// (spec §4.6 "Parent update ... Parent delete"). Raises on the first
/// uncovered child found; the caller (plpgsql trigger) does not need the
/// return value, only the potential error.
#[pg_extern]
fn temporal_fk_check_parent_change(key_name: &str, key_values: Vec<Option<String>>) -> bool {
    with_entry(key_name, |entry| -> SagaResult<bool> {
        if key_values.iter().any(Option::is_none) {
            return Ok(true);
        }
        let child_where = equality_where(&entry.child_columns, &key_values, "c");
        let sql = format!(
            "SELECT c.{from}::text, c.{until}::text FROM {cs}.{ct} c WHERE {w}",
            from = qi(&entry.child_valid_from),
            until = qi(&entry.child_valid_until),
            cs = qi(&entry.child_schema),
            ct = qi(&entry.child_table),
            w = child_where,
        );
        let children: Vec<(String, String)> = Spi::connect(|client| {
            client
                .select(&sql, None, &[])
                .map(|t| {
                    t.into_iter()
                        .filter_map(|r| {
                            let f: Option<String> = r.get(1).ok().flatten();
                            let u: Option<String> = r.get(2).ok().flatten();
                            f.zip(u)
                        })
                        .collect()
                })
                .unwrap_or_default()
        });
        for (from, until) in children {
            if !check_coverage(entry, &key_values, &from, &until) {
                return Err(SagaError::integrity(
                    "FOREIGN_KEY_VIOLATION",
                    ObjectRef::table(&entry.child_schema, &entry.child_table),
                    format!(
                        "foreign key \"{key_name}\": child row {} is no longer covered by parent \"{}\".\"{}\"",
                        crate::error::fmt_interval(&from, &until),
                        entry.parent_schema,
                        entry.parent_table,
                    ),
                ));
            }
        }
        Ok(true)
    })
    .and_then(|r| r)
    .unwrap_or_else(raise_violation)
}

/// Raises `e` as a Postgres ERROR tagged with its SQLSTATE-flavored class
/// (spec §4.6/§7 "FOREIGN_KEY_VIOLATION-class error").
fn raise_violation(e: SagaError) -> bool {
    pgrx::error!("[{}] {}", e.class(), e)
}

enum NullOutcome {
    AcceptNoCheck,
    MixedNullError,
    MustCheck,
}

fn classify_nulls(key_values: &[Option<String>], match_mode: MatchMode) -> NullOutcome {
    let null_count = key_values.iter().filter(|v| v.is_none()).count();
    match match_mode {
        MatchMode::Simple => {
            if null_count > 0 {
                NullOutcome::AcceptNoCheck
            } else {
                NullOutcome::MustCheck
            }
        }
        MatchMode::Full => {
            if null_count == key_values.len() {
                NullOutcome::AcceptNoCheck
            } else if null_count == 0 {
                NullOutcome::MustCheck
            } else {
                NullOutcome::MixedNullError
            }
        }
        MatchMode::Partial => pgrx::error!("MATCH PARTIAL is not implemented"),
    }
}

fn equality_where(columns: &[String], values: &[Option<String>], alias: &str) -> String {
    columns
        .iter()
        .zip(values)
        .map(|(col, val)| match val {
            Some(v) => format!("{alias}.{} = '{}'", qi(col), v.replace('\'', "''")),
            None => format!("{alias}.{} IS NULL", qi(col)),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Runs the §4.2 coverage aggregate over parent rows sharing `key_values`,
/// against `[child_from, child_until)`.
fn check_coverage(entry: &FkCacheEntry, key_values: &[Option<String>], child_from: &str, child_until: &str) -> bool {
    let where_clause = equality_where(&entry.parent_columns, key_values, "p");
    let sql = format!(
        "SELECT temporal.covers_without_gaps(p.{from}::text, p.{until}::text, '{tf}', '{tu}', {numeric}, {domain}) \
         FROM {ps}.{pt} p WHERE {w} ORDER BY p.{from}",
        from = qi(&entry.parent_valid_from),
        until = qi(&entry.parent_valid_until),
        tf = child_from.replace('\'', "''"),
        tu = child_until.replace('\'', "''"),
        numeric = entry.is_numeric,
        domain = entry.domain_code,
        ps = qi(&entry.parent_schema),
        pt = qi(&entry.parent_table),
        w = where_clause,
    );
    Spi::get_one::<bool>(&sql).unwrap_or(Some(false)).unwrap_or(false)
}

/// Names and creates the four plpgsql trigger functions + constraint
/// triggers a temporal foreign key needs (spec §3 "four trigger handles").
pub struct TriggerNames {
    pub insert_trigger: String,
    pub update_trigger: String,
    pub parent_update_trigger: String,
    pub parent_delete_trigger: String,
}

pub fn generate_key_name(child_table: &str, child_columns: &[String], era_name: &str) -> String {
    truncate_identifier(
        &format!("{child_table}_{}_{era_name}_fkey", child_columns.join("_")),
        MAX_IDENTIFIER_LENGTH,
    )
}

/// spec §4.3 step 3 for foreign keys: create the child-side and parent-side
/// constraint triggers. All four call back into the two `#[pg_extern]`
/// functions above; per-row NEW/OLD column extraction is the only thing the
/// plpgsql bodies do, since constraint triggers cannot be implemented
/// directly against a typed Rust signature without knowing the child/parent
/// column list at compile time.
pub fn create_triggers(
    child_schema: &str,
    child_table: &str,
    child_columns: &[String],
    child_era: &Era,
    parent_uk: &UniqueKey,
    match_mode: MatchMode,
    key_name: &str,
) -> SagaResult<TriggerNames> {
    if match_mode == MatchMode::Partial {
        return Err(SagaError::argument("MATCH PARTIAL is reserved and not implemented".to_string()));
    }

    let child_fn_name = truncate_identifier(&format!("{key_name}_child_chk"), MAX_IDENTIFIER_LENGTH);
    let parent_fn_name = truncate_identifier(&format!("{key_name}_parent_chk"), MAX_IDENTIFIER_LENGTH);
    let insert_trigger = truncate_identifier(&format!("{key_name}_insert"), MAX_IDENTIFIER_LENGTH);
    let update_trigger = truncate_identifier(&format!("{key_name}_update"), MAX_IDENTIFIER_LENGTH);
    let parent_update_trigger = truncate_identifier(&format!("{key_name}_parent_update"), MAX_IDENTIFIER_LENGTH);
    let parent_delete_trigger = truncate_identifier(&format!("{key_name}_parent_delete"), MAX_IDENTIFIER_LENGTH);

    let key_array = child_columns
        .iter()
        .map(|c| format!("NEW.{}::text", qi(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let child_fn_sql = format!(
        "CREATE FUNCTION {schema}.{fname}() RETURNS trigger AS $trig$ \
         BEGIN \
           PERFORM temporal_fk_check_child('{key_name}', ARRAY[{key_array}]::text[], NEW.{from}::text, NEW.{until}::text); \
           RETURN NEW; \
         END; \
         $trig$ LANGUAGE plpgsql",
        schema = qi(child_schema),
        fname = qi(&child_fn_name),
        key_array = key_array,
        from = qi(&child_era.valid_from_column_name),
        until = qi(&child_era.valid_until_column_name),
    );
    Spi::run(&child_fn_sql).map_err(|e| SagaError::consistency(ObjectRef::table(child_schema, child_table), e.to_string()))?;

    for (trigger_name, event) in [(&insert_trigger, "INSERT"), (&update_trigger, "UPDATE")] {
        let sql = format!(
            "CREATE CONSTRAINT TRIGGER {trig} AFTER {event} ON {schema}.{tbl} \
             DEFERRABLE INITIALLY IMMEDIATE FOR EACH ROW EXECUTE FUNCTION {schema}.{fname}()",
            trig = qi(trigger_name),
            event = event,
            schema = qi(child_schema),
            tbl = qi(child_table),
            fname = qi(&child_fn_name),
        );
        Spi::run(&sql).map_err(|e| SagaError::consistency(ObjectRef::table(child_schema, child_table), e.to_string()))?;
    }

    let parent_key_array = parent_uk
        .column_names
        .iter()
        .map(|c| format!("OLD.{}::text", qi(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let parent_fn_sql = format!(
        "CREATE FUNCTION {schema}.{fname}() RETURNS trigger AS $trig$ \
         BEGIN \
           PERFORM temporal_fk_check_parent_change('{key_name}', ARRAY[{key_array}]::text[]); \
           RETURN COALESCE(NEW, OLD); \
         END; \
         $trig$ LANGUAGE plpgsql",
        schema = qi(&parent_uk.table_schema),
        fname = qi(&parent_fn_name),
        key_array = parent_key_array,
    );
    Spi::run(&parent_fn_sql)
        .map_err(|e| SagaError::consistency(ObjectRef::table(&parent_uk.table_schema, &parent_uk.table_name), e.to_string()))?;

    for (trigger_name, event) in [(&parent_update_trigger, "UPDATE"), (&parent_delete_trigger, "DELETE")] {
        let sql = format!(
            "CREATE CONSTRAINT TRIGGER {trig} AFTER {event} ON {schema}.{tbl} \
             DEFERRABLE INITIALLY DEFERRED FOR EACH ROW EXECUTE FUNCTION {schema}.{fname}()",
            trig = qi(trigger_name),
            event = event,
            schema = qi(&parent_uk.table_schema),
            tbl = qi(&parent_uk.table_name),
            fname = qi(&parent_fn_name),
        );
        Spi::run(&sql)
            .map_err(|e| SagaError::consistency(ObjectRef::table(&parent_uk.table_schema, &parent_uk.table_name), e.to_string()))?;
    }

    Ok(TriggerNames {
        insert_trigger,
        update_trigger,
        parent_update_trigger,
        parent_delete_trigger,
    })
}

/// spec §6 `drop_foreign_key`: drops the triggers and their backing functions,
/// the catalog row, and evicts the cache entry.
pub fn drop_foreign_key(key_name: &str, cleanup: bool) -> SagaResult<()> {
    let fk = crate::catalog::find_foreign_key(key_name)?;
    invalidate(key_name);

    if cleanup {
        let parent_uk = crate::catalog::find_unique_key(&fk.parent_key_name)?;
        let drops = [
            (&fk.insert_trigger, &fk.child_schema, &fk.child_table),
            (&fk.update_trigger, &fk.child_schema, &fk.child_table),
            (&fk.parent_update_trigger, &parent_uk.table_schema, &parent_uk.table_name),
            (&fk.parent_delete_trigger, &parent_uk.table_schema, &parent_uk.table_name),
        ];
        for (trigger_name, schema, table) in drops {
            let sql = format!(
                "DROP TRIGGER IF EXISTS {trig} ON {schema}.{tbl}",
                trig = qi(trigger_name),
                schema = qi(schema),
                tbl = qi(table),
            );
            let _ = Spi::run(&sql);
        }
    }

    let sql = format!("DELETE FROM temporal.foreign_key WHERE key_name = '{}'", key_name.replace('\'', "''"));
    Spi::run(&sql).map_err(|e| SagaError::consistency(ObjectRef::table(&fk.child_schema, &fk.child_table), e.to_string()))
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use super::*;

    #[pg_test]
    fn test_simple_match_accepts_null_key() {
        let outcome = classify_nulls(&[None, Some("1".to_string())], MatchMode::Simple);
        assert!(matches!(outcome, NullOutcome::AcceptNoCheck));
    }

    #[pg_test]
    fn test_full_match_rejects_mixed_null() {
        let outcome = classify_nulls(&[None, Some("1".to_string())], MatchMode::Full);
        assert!(matches!(outcome, NullOutcome::MixedNullError));
    }

    #[pg_test]
    fn test_full_match_accepts_all_null() {
        let outcome = classify_nulls(&[None, None], MatchMode::Full);
        assert!(matches!(outcome, NullOutcome::AcceptNoCheck));
    }
}
