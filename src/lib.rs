use pgrx::prelude::*;

pg_module_magic!();

mod catalog;
mod config;
mod coverage;
mod error;
mod executor;
mod foreign_key;
mod introspect;
mod lifecycle;
mod lock;
mod range;
mod reader;
mod sweep;
mod types;
mod unique_key;
mod util;

use types::{DeleteMode, MergeMode, PlanRow};

/// Registers the `temporal.*` GUCs. Runs once when the shared library loads.
#[allow(non_snake_case)]
#[pg_guard]
pub extern "C" fn _PG_init() {
    config::init();
}

// The planner's wire format: three enums shared by the plan/feedback tables,
// and the session-scoped plan table itself. `pg_temp` objects can't be
// created at CREATE EXTENSION time, so the plan table is created on demand
// by `ensure_plan_temp_table`.
extension_sql!(
    r#"
    CREATE TYPE temporal.temporal_merge_plan_action AS ENUM (
        'INSERT', 'UPDATE', 'DELETE',
        'SKIP_IDENTICAL', 'SKIP_NO_TARGET', 'SKIP_FILTERED', 'SKIP_ECLIPSED', 'ERROR'
    );
    CREATE TYPE temporal.temporal_merge_update_effect AS ENUM ('NONE', 'SHRINK', 'MOVE', 'GROW');
    CREATE TYPE temporal.allen_interval_relation AS ENUM (
        'precedes', 'meets', 'overlaps', 'starts', 'during', 'finishes', 'equals',
        'preceded_by', 'met_by', 'overlapped_by', 'started_by', 'contains', 'finished_by'
    );
    CREATE TYPE temporal.temporal_merge_feedback_status AS ENUM (
        'APPLIED', 'SKIPPED', 'TARGET_NOT_FOUND', 'ERROR'
    );
    "#,
    name = "temporal_merge_wire_types",
    requires = ["temporal_catalog_tables"]
);

/// Create this session's scratch plan table if it isn't there yet. Idempotent
/// within a session; the table is dropped automatically at session end since
/// it lives in `pg_temp`.
fn ensure_plan_temp_table() {
    Spi::connect_mut(|client| {
        client
            .update(
                r#"
                CREATE TEMP TABLE IF NOT EXISTS pg_temp.temporal_merge_plan (
                    plan_op_seq bigint NOT NULL,
                    statement_seq int NOT NULL,
                    row_ids bigint[] NOT NULL,
                    operation temporal.temporal_merge_plan_action NOT NULL,
                    update_effect temporal.temporal_merge_update_effect,
                    causal_id text,
                    is_new_entity boolean NOT NULL,
                    entity_keys jsonb,
                    identity_keys jsonb,
                    lookup_keys jsonb,
                    s_t_relation temporal.allen_interval_relation,
                    b_a_relation temporal.allen_interval_relation,
                    old_valid_from text,
                    old_valid_until text,
                    new_valid_from text,
                    new_valid_until text,
                    old_valid_range text,
                    new_valid_range text,
                    data jsonb,
                    feedback jsonb,
                    trace jsonb,
                    grouping_key text
                ) ON COMMIT DROP
                "#,
                None,
                &[],
            )
            .unwrap_or_else(|e| pgrx::error!("Failed to create plan temp table: {}", e));
        client
            .update("TRUNCATE pg_temp.temporal_merge_plan", None, &[])
            .unwrap_or_else(|e| pgrx::error!("Failed to truncate plan temp table: {}", e));
    });
}

/// Native Rust implementation of the temporal_merge planner (spec §4.8).
/// Produces the same shape as the teacher's `sql_saga.temporal_merge_plan()`
/// output, via direct INSERT into `pg_temp.temporal_merge_plan`.
///
/// This function reads source + target rows via 2 bulk SPI scans, then performs
/// all planning (atomic segmentation, payload resolution, coalescing, diff,
/// operation classification, statement sequencing) in memory using a sweep-line
/// algorithm.
#[pg_extern]
fn temporal_merge_plan_native(
    target_table: pg_sys::Oid,
    source_table: pg_sys::Oid,
    mode: &str,
    era_name: Option<&str>,
    identity_columns: Option<Vec<String>>,
    row_id_column: default!(&str, "'row_id'"),
    founding_id_column: Option<&str>,
    delete_mode: default!(&str, "'NONE'"),
    lookup_keys: Option<pgrx::JsonB>,
    ephemeral_columns: Option<Vec<String>>,
    p_log_trace: Option<bool>,
    _p_log_sql: default!(bool, false),
) -> i64 {
    ensure_plan_temp_table();

    let era_name = era_name.map(str::to_string).unwrap_or_else(config::default_era_name);
    let p_log_trace = p_log_trace.unwrap_or_else(config::log_trace_default);

    let (_ctx, plan_rows) = build_plan(
        target_table,
        source_table,
        mode,
        &era_name,
        identity_columns,
        row_id_column,
        founding_id_column,
        delete_mode,
        lookup_keys,
        ephemeral_columns,
        p_log_trace,
    );

    // Insert into pg_temp.temporal_merge_plan
    emit_plan_rows(&plan_rows)
}

/// Run the planner (era introspection, bulk SPI reads, sweep-line planning)
/// and hand back both the context it was computed with and the resulting
/// operations. Shared by `temporal_merge_plan_native` (exposes the plan for
/// inspection) and `executor::temporal_merge` (plans and applies in one call).
pub(crate) fn build_plan(
    target_table: pg_sys::Oid,
    source_table: pg_sys::Oid,
    mode: &str,
    era_name: &str,
    identity_columns: Option<Vec<String>>,
    row_id_column: &str,
    founding_id_column: Option<&str>,
    delete_mode: &str,
    lookup_keys: Option<pgrx::JsonB>,
    ephemeral_columns: Option<Vec<String>>,
    p_log_trace: bool,
) -> (types::PlannerContext, Vec<PlanRow>) {
    let mode = MergeMode::from_str(mode)
        .unwrap_or_else(|| pgrx::error!("Invalid merge mode: {}", mode));
    let delete_mode = DeleteMode::from_str(delete_mode)
        .unwrap_or_else(|| pgrx::error!("Invalid delete mode: {}", delete_mode));

    // Parse lookup_keys JSONB into Vec<Vec<String>>, preserving per-set grouping
    // (PL/pgSQL tries each set with OR logic: match on ANY set succeeds).
    let lookup_key_sets = parse_lookup_key_sets(lookup_keys);

    // Phase 1: Introspect era metadata
    let era = introspect::introspect_era(target_table, era_name)
        .unwrap_or_else(|e| pgrx::error!("{}", e));

    // Introspect PK columns
    let mut temporal_cols = vec![era.range_col.clone(), era.valid_from_col.clone()];
    if let Some(ref vt) = era.valid_to_col {
        temporal_cols.push(vt.clone());
    }
    temporal_cols.push(era.valid_until_col.clone());
    let pk_cols = introspect::introspect_pk_cols(target_table, &temporal_cols);

    // Build planner context
    let ctx = introspect::build_planner_context(
        mode,
        delete_mode,
        era,
        identity_columns,
        lookup_key_sets,
        pk_cols,
        ephemeral_columns.unwrap_or_default(),
        founding_id_column.map(|s| s.to_string()),
        row_id_column.to_string(),
        p_log_trace,
    );

    // Phase 2: Bulk SPI reads (source + target share one column-introspection pass)
    let (source_rows, target_rows) = reader::read_rows(source_table, target_table, &ctx)
        .unwrap_or_else(|e| pgrx::error!("Failed to read source/target rows: {}", e));

    // Phase 3: Sweep-line planning
    let plan_rows = sweep::sweep_line_plan(source_rows, target_rows, &ctx);

    (ctx, plan_rows)
}

/// Parse lookup_keys JSONB (array of arrays) into the list of key sets, each
/// set an independent natural key tried with OR logic during entity
/// correlation (`sweep::correlate_entities`).
fn parse_lookup_key_sets(lookup_keys: Option<pgrx::JsonB>) -> Vec<Vec<String>> {
    let Some(pgrx::JsonB(val)) = lookup_keys else {
        return Vec::new();
    };
    let Some(arr) = val.as_array() else {
        return Vec::new();
    };
    let mut sets = Vec::new();
    for key_array in arr {
        if let Some(inner) = key_array.as_array() {
            let set: Vec<String> = inner
                .iter()
                .filter_map(|c| c.as_str().map(|s| s.to_string()))
                .collect();
            if !set.is_empty() {
                sets.push(set);
            }
        }
    }
    sets
}

/// Insert plan rows into pg_temp.temporal_merge_plan via SPI.
fn emit_plan_rows(plan_rows: &[PlanRow]) -> i64 {
    if plan_rows.is_empty() {
        return 0;
    }

    // Build a batch INSERT statement
    let mut values_parts: Vec<String> = Vec::with_capacity(plan_rows.len());

    for row in plan_rows {
        let row_ids_str = format!(
            "ARRAY[{}]::bigint[]",
            row.row_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );

        let operation = format!("'{}'::temporal.temporal_merge_plan_action", row.operation.as_str());
        let update_effect = row
            .update_effect
            .map(|e| format!("'{}'::temporal.temporal_merge_update_effect", e.as_str()))
            .unwrap_or_else(|| "NULL".to_string());

        let causal_id = sql_text_or_null(&row.causal_id);
        let is_new_entity = row.is_new_entity.to_string();
        let entity_keys = sql_jsonb_or_null(&row.entity_keys);
        let identity_keys = sql_jsonb_or_null(&row.identity_keys);
        let lookup_keys = sql_jsonb_or_null(&row.lookup_keys);

        let s_t_relation = row
            .s_t_relation
            .map(|r| format!("'{}'::temporal.allen_interval_relation", r.as_str()))
            .unwrap_or_else(|| "NULL".to_string());
        let b_a_relation = row
            .b_a_relation
            .map(|r| format!("'{}'::temporal.allen_interval_relation", r.as_str()))
            .unwrap_or_else(|| "NULL".to_string());

        let old_valid_from = sql_text_or_null(&row.old_valid_from);
        let old_valid_until = sql_text_or_null(&row.old_valid_until);
        let new_valid_from = sql_text_or_null(&row.new_valid_from);
        let new_valid_until = sql_text_or_null(&row.new_valid_until);
        let old_valid_range = sql_text_or_null(&row.old_valid_range);
        let new_valid_range = sql_text_or_null(&row.new_valid_range);
        let data = sql_jsonb_or_null(&row.data);
        let feedback = sql_jsonb_or_null(&row.feedback);
        let trace = sql_jsonb_or_null(&row.trace);
        let grouping_key = sql_escape_text(&row.grouping_key);

        values_parts.push(format!(
            "({plan_op_seq}, {stmt_seq}, {row_ids}, {op}, {ue}, {causal}, {is_new}, {ek}, {ik}, {lk}, {st}, {ba}, {ovf}, {ovu}, {nvf}, {nvu}, {ovr}, {nvr}, {data}, {fb}, {trace}, {gk})",
            plan_op_seq = row.plan_op_seq,
            stmt_seq = row.statement_seq,
            row_ids = row_ids_str,
            op = operation,
            ue = update_effect,
            causal = causal_id,
            is_new = is_new_entity,
            ek = entity_keys,
            ik = identity_keys,
            lk = lookup_keys,
            st = s_t_relation,
            ba = b_a_relation,
            ovf = old_valid_from,
            ovu = old_valid_until,
            nvf = new_valid_from,
            nvu = new_valid_until,
            ovr = old_valid_range,
            nvr = new_valid_range,
            data = data,
            fb = feedback,
            trace = trace,
            gk = grouping_key,
        ));
    }

    // Batch insert in chunks to avoid SQL statement size limits
    let chunk_size = config::batch_chunk_size();
    let mut total = 0i64;

    Spi::connect_mut(|client| {
        for chunk in values_parts.chunks(chunk_size) {
            let sql = format!(
                "INSERT INTO pg_temp.temporal_merge_plan (plan_op_seq, statement_seq, row_ids, operation, update_effect, causal_id, is_new_entity, entity_keys, identity_keys, lookup_keys, s_t_relation, b_a_relation, old_valid_from, old_valid_until, new_valid_from, new_valid_until, old_valid_range, new_valid_range, data, feedback, trace, grouping_key) VALUES {}",
                chunk.join(", ")
            );
            client.update(&sql, None, &[])
                .unwrap_or_else(|e| pgrx::error!("Failed to insert plan rows: {}", e));
            total += chunk.len() as i64;
        }
    });

    total
}

fn sql_text_or_null(val: &Option<String>) -> String {
    match val {
        Some(s) => format!("'{}'", s.replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

fn sql_escape_text(val: &str) -> String {
    format!("'{}'", val.replace('\'', "''"))
}

fn sql_jsonb_or_null(val: &Option<serde_json::Value>) -> String {
    match val {
        Some(v) => format!(
            "'{}'::jsonb",
            serde_json::to_string(v)
                .unwrap_or_else(|_| "{}".to_string())
                .replace('\'', "''")
        ),
        None => "NULL".to_string(),
    }
}

// ── Tests ──

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    #[pg_test]
    fn test_extension_loads() {
        let result = Spi::get_one::<bool>("SELECT true");
        assert_eq!(result, Ok(Some(true)));
    }

    #[pg_test]
    fn test_allen_relation_equals() {
        use crate::types::AllenRelation;
        let r = AllenRelation::compute("2024-01-01", "2024-02-01", "2024-01-01", "2024-02-01");
        assert_eq!(r, Some(AllenRelation::Equals));
    }

    #[pg_test]
    fn test_allen_relation_precedes() {
        use crate::types::AllenRelation;
        let r = AllenRelation::compute("2024-01-01", "2024-02-01", "2024-03-01", "2024-04-01");
        assert_eq!(r, Some(AllenRelation::Precedes));
    }

    #[pg_test]
    fn test_allen_relation_meets() {
        use crate::types::AllenRelation;
        let r = AllenRelation::compute("2024-01-01", "2024-02-01", "2024-02-01", "2024-03-01");
        assert_eq!(r, Some(AllenRelation::Meets));
    }

    #[pg_test]
    fn test_allen_relation_overlaps() {
        use crate::types::AllenRelation;
        let r = AllenRelation::compute("2024-01-01", "2024-03-01", "2024-02-01", "2024-04-01");
        assert_eq!(r, Some(AllenRelation::Overlaps));
    }

    #[pg_test]
    fn test_strip_nulls() {
        use crate::sweep::strip_nulls;
        let mut map = serde_json::Map::new();
        map.insert("a".to_string(), serde_json::Value::Number(1.into()));
        map.insert("b".to_string(), serde_json::Value::Null);
        map.insert("c".to_string(), serde_json::Value::String("x".to_string()));
        let stripped = strip_nulls(&map);
        assert_eq!(stripped.len(), 2);
        assert!(stripped.contains_key("a"));
        assert!(stripped.contains_key("c"));
        assert!(!stripped.contains_key("b"));
    }
}

#[cfg(test)]
pub mod pg_test {
    pub fn setup(_options: Vec<&str>) {}

    pub fn postgresql_conf_options() -> Vec<&'static str> {
        vec![]
    }
}
