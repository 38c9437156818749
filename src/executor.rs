//! The temporal merge executor (C8): takes the plan `temporal_merge_plan_native`
//! (or `build_plan`) produces and applies it against the target table, in
//! `statement_seq` order, under `SET CONSTRAINTS ALL DEFERRED` so that C6
//! (foreign key) gaps tolerated mid-batch are closed before the transaction's
//! own constraints fire again.

use std::collections::HashMap;

use pgrx::prelude::*;
use serde_json::Value;

use crate::reader::resolve_table_name;
use crate::types::{FeedbackRow, FeedbackStatus, PlanAction, PlannerContext, PlanRow};
use crate::util::qi;

/// Values captured from a founding INSERT's `RETURNING` clause, keyed by the
/// plan's `causal_id`, so every later segment of the same not-yet-created
/// entity addresses the row this batch just created (spec's "Founding IDs").
type FoundingMap = HashMap<String, serde_json::Map<String, Value>>;

/// `temporal_merge`'s public entry point. Plans, then executes, depositing
/// one feedback row per source row into `pg_temp.temporal_merge_feedback`.
#[pg_extern]
#[allow(clippy::too_many_arguments)]
fn temporal_merge(
    target_table: pg_sys::Oid,
    source_table: pg_sys::Oid,
    identity_columns: Option<Vec<String>>,
    mode: &str,
    delete_mode: default!(&str, "'NONE'"),
    ephemeral_columns: Option<Vec<String>>,
    era_name: default!(&str, "'valid'"),
    source_row_id_column: default!(&str, "'row_id'"),
    founding_id_column: Option<&str>,
    update_source_with_assigned_ids: default!(bool, false),
) -> i64 {
    let (ctx, plan_rows) = crate::build_plan(
        target_table,
        source_table,
        mode,
        era_name,
        identity_columns,
        source_row_id_column,
        founding_id_column,
        delete_mode,
        None,
        ephemeral_columns,
        false,
    );

    let target_ident =
        resolve_table_name(target_table).unwrap_or_else(|e| pgrx::error!("{}", e));

    let feedback = execute_plan(&target_ident, &ctx, plan_rows);

    if update_source_with_assigned_ids {
        let source_ident =
            resolve_table_name(source_table).unwrap_or_else(|e| pgrx::error!("{}", e));
        write_back_assigned_ids(&source_ident, &ctx, source_row_id_column, &feedback);
    }

    ensure_feedback_temp_table();
    emit_feedback_rows(&feedback)
}

/// Apply every DML plan row against `target_ident` in `statement_seq` order,
/// deferring constraints for the duration, and return one feedback row per
/// source row covered by the plan (DELETE-only operations, which have no
/// source row of their own, contribute no feedback).
pub(crate) fn execute_plan(
    target_ident: &str,
    ctx: &PlannerContext,
    mut plan_rows: Vec<PlanRow>,
) -> Vec<FeedbackRow> {
    plan_rows.sort_by_key(|r| r.statement_seq);

    set_constraints_deferred();

    let mut founding: FoundingMap = HashMap::new();
    let mut feedback = Vec::with_capacity(plan_rows.len());

    for row in &plan_rows {
        match row.operation {
            PlanAction::Delete => {
                apply_delete(target_ident, row, ctx);
                // DELETEs carve out missing timeline/entities; they are not
                // attributable to any single source row, so no feedback row.
            }
            PlanAction::Update => {
                apply_update(target_ident, row, ctx, &founding);
                push_applied_feedback(&mut feedback, row, ctx, &founding);
            }
            PlanAction::Insert => {
                apply_insert(target_ident, row, ctx, &mut founding);
                push_applied_feedback(&mut feedback, row, ctx, &founding);
            }
            _ => push_non_dml_feedback(&mut feedback, row),
        }
    }

    set_constraints_immediate();

    feedback
}

fn set_constraints_deferred() {
    Spi::connect_mut(|client| {
        client
            .update("SET CONSTRAINTS ALL DEFERRED", None, &[])
            .unwrap_or_else(|e| pgrx::error!("Failed to defer constraints: {}", e));
    });
}

fn set_constraints_immediate() {
    Spi::connect_mut(|client| {
        client
            .update("SET CONSTRAINTS ALL IMMEDIATE", None, &[])
            .unwrap_or_else(|e| pgrx::error!("Failed to restore immediate constraints: {}", e));
    });
}

// ── Payload assembly ──

/// `entity_keys` merged with `data`, right side wins on overlap — mirrors the
/// planner's own `entity_keys || data` convention for "full row" payloads.
fn merge_payload(row: &PlanRow) -> serde_json::Map<String, Value> {
    let mut merged = serde_json::Map::new();
    if let Some(Value::Object(ek)) = &row.entity_keys {
        for (k, v) in ek {
            merged.insert(k.clone(), v.clone());
        }
    }
    if let Some(Value::Object(d)) = &row.data {
        for (k, v) in d {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Fill any still-unresolved identity column in `map` from a founding group's
/// already-captured values.
fn apply_founding(
    map: &mut serde_json::Map<String, Value>,
    causal_id: &Option<String>,
    ctx: &PlannerContext,
    founding: &FoundingMap,
) {
    let Some(cid) = causal_id else { return };
    let Some(vals) = founding.get(cid) else { return };
    for col in &ctx.identity_columns {
        let unresolved = map.get(col).map(|v| v.is_null()).unwrap_or(true);
        if unresolved {
            if let Some(v) = vals.get(col) {
                map.insert(col.clone(), v.clone());
            }
        }
    }
}

/// Render one JSON scalar as a SQL literal. Every value — including numbers
/// and booleans — is emitted as a quoted "unknown"-type literal so Postgres'
/// own input function for the destination column decides how to parse it;
/// this is what lets one code path write into text, numeric, boolean, date,
/// and jsonb columns alike without introspecting their types.
fn literal(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => format!("'{}'", b),
        Value::Number(n) => format!("'{}'", n),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn temporal_literal(value: &str, ctx: &PlannerContext) -> String {
    format!("'{}'::{}", value.replace('\'', "''"), ctx.era.range_subtype)
}

// ── WHERE / SET / INSERT builders ──

fn build_where(row: &PlanRow, ctx: &PlannerContext, founding: &FoundingMap) -> String {
    let mut keys = match &row.entity_keys {
        Some(Value::Object(m)) => m.clone(),
        _ => serde_json::Map::new(),
    };
    apply_founding(&mut keys, &row.causal_id, ctx, founding);

    let mut clauses: Vec<String> = keys
        .iter()
        .map(|(k, v)| format!("{} = {}", qi(k), literal(v)))
        .collect();

    if let Some(f) = &row.old_valid_from {
        clauses.push(format!("{} = {}", qi(&ctx.era.valid_from_col), temporal_literal(f, ctx)));
    }
    if let Some(u) = &row.old_valid_until {
        clauses.push(format!("{} = {}", qi(&ctx.era.valid_until_col), temporal_literal(u, ctx)));
    }

    if clauses.is_empty() {
        pgrx::error!("temporal_merge: cannot locate target row — neither entity keys nor temporal bounds are known");
    }
    clauses.join(" AND ")
}

fn apply_delete(target_ident: &str, row: &PlanRow, ctx: &PlannerContext) {
    let founding = FoundingMap::new();
    let where_clause = build_where(row, ctx, &founding);
    let sql = format!("DELETE FROM {} WHERE {}", target_ident, where_clause);
    Spi::connect_mut(|client| {
        client
            .update(&sql, None, &[])
            .unwrap_or_else(|e| pgrx::error!("temporal_merge DELETE failed: {}", e));
    });
}

fn apply_update(target_ident: &str, row: &PlanRow, ctx: &PlannerContext, founding: &FoundingMap) {
    let where_clause = build_where(row, ctx, founding);

    let data = match &row.data {
        Some(Value::Object(m)) => m.clone(),
        _ => serde_json::Map::new(),
    };
    let mut sets: Vec<String> = data
        .iter()
        .map(|(k, v)| format!("{} = {}", qi(k), literal(v)))
        .collect();
    if let Some(f) = &row.new_valid_from {
        sets.push(format!("{} = {}", qi(&ctx.era.valid_from_col), temporal_literal(f, ctx)));
    }
    if let Some(u) = &row.new_valid_until {
        sets.push(format!("{} = {}", qi(&ctx.era.valid_until_col), temporal_literal(u, ctx)));
    }
    if sets.is_empty() {
        // Pure range move with no payload change still needs its SET list non-empty;
        // new_valid_from/until cover that in practice, but guard against a
        // degenerate all-NULL row rather than emit invalid SQL.
        return;
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        target_ident,
        sets.join(", "),
        where_clause
    );
    Spi::connect_mut(|client| {
        client
            .update(&sql, None, &[])
            .unwrap_or_else(|e| pgrx::error!("temporal_merge UPDATE failed: {}", e));
    });
}

fn apply_insert(target_ident: &str, row: &PlanRow, ctx: &PlannerContext, founding: &mut FoundingMap) {
    let mut merged = merge_payload(row);
    apply_founding(&mut merged, &row.causal_id, ctx, founding);

    // A founding group's identity value is only unknown the first time we see
    // it; every later segment for the same new entity already has it filled
    // in by `apply_founding` above and should write it explicitly rather than
    // asking the DBMS to generate a second, different value.
    let needs_returning = row.is_new_entity
        && row.causal_id.is_some()
        && !ctx.identity_columns.is_empty()
        && !founding.contains_key(row.causal_id.as_deref().unwrap_or(""));

    let mut cols = Vec::new();
    let mut vals = Vec::new();
    for (k, v) in &merged {
        if needs_returning && ctx.identity_columns.contains(k) && v.is_null() {
            continue; // let the DBMS assign it (serial/identity/generated default)
        }
        cols.push(qi(k));
        vals.push(literal(v));
    }
    if let Some(f) = &row.new_valid_from {
        cols.push(qi(&ctx.era.valid_from_col));
        vals.push(temporal_literal(f, ctx));
    }
    if let Some(u) = &row.new_valid_until {
        cols.push(qi(&ctx.era.valid_until_col));
        vals.push(temporal_literal(u, ctx));
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        target_ident,
        cols.join(", "),
        vals.join(", ")
    );

    if needs_returning {
        let returning = ctx
            .identity_columns
            .iter()
            .map(|c| qi(c))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" RETURNING {}", returning));

        let captured = Spi::connect(|client| {
            let rows = client
                .select(&sql, None, &[])
                .unwrap_or_else(|e| pgrx::error!("temporal_merge INSERT failed: {}", e));
            let Some(first) = rows.first() else {
                return serde_json::Map::new();
            };
            let mut out = serde_json::Map::new();
            for (i, col) in ctx.identity_columns.iter().enumerate() {
                if let Ok(Some(text)) = first.get::<String>(i + 1) {
                    out.insert(col.clone(), Value::String(text));
                }
            }
            out
        });
        if let Some(cid) = &row.causal_id {
            founding.insert(cid.clone(), captured);
        }
    } else {
        Spi::connect_mut(|client| {
            client
                .update(&sql, None, &[])
                .unwrap_or_else(|e| pgrx::error!("temporal_merge INSERT failed: {}", e));
        });
    }
}

// ── Feedback ──

fn push_applied_feedback(
    feedback: &mut Vec<FeedbackRow>,
    row: &PlanRow,
    ctx: &PlannerContext,
    founding: &FoundingMap,
) {
    let assigned_entity_ids = if ctx.identity_columns.is_empty() {
        None
    } else {
        let mut ids = match &row.identity_keys {
            Some(Value::Object(m)) => m.clone(),
            _ => serde_json::Map::new(),
        };
        apply_founding(&mut ids, &row.causal_id, ctx, founding);
        if ids.is_empty() {
            None
        } else {
            Some(Value::Object(ids))
        }
    };

    for row_id in &row.row_ids {
        feedback.push(FeedbackRow {
            source_row_id: *row_id,
            status: FeedbackStatus::Applied,
            assigned_entity_ids: assigned_entity_ids.clone(),
            error_message: None,
        });
    }
}

fn push_non_dml_feedback(feedback: &mut Vec<FeedbackRow>, row: &PlanRow) {
    let status = match row.operation {
        PlanAction::SkipNoTarget => FeedbackStatus::TargetNotFound,
        PlanAction::SkipIdentical | PlanAction::SkipFiltered | PlanAction::SkipEclipsed => {
            FeedbackStatus::Skipped
        }
        PlanAction::Error => FeedbackStatus::Error,
        _ => return,
    };
    let error_message = row
        .feedback
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    for row_id in &row.row_ids {
        feedback.push(FeedbackRow {
            source_row_id: *row_id,
            status,
            assigned_entity_ids: None,
            error_message: error_message.clone(),
        });
    }
}

/// Copy every captured founding identity back onto its source rows, keyed by
/// `source_row_id_column`, for callers that opted into `update_source_with_assigned_ids`.
fn write_back_assigned_ids(
    source_ident: &str,
    ctx: &PlannerContext,
    source_row_id_column: &str,
    feedback: &[FeedbackRow],
) {
    if ctx.identity_columns.is_empty() {
        return;
    }
    Spi::connect_mut(|client| {
        for fb in feedback {
            let Some(Value::Object(ids)) = &fb.assigned_entity_ids else {
                continue;
            };
            let sets: Vec<String> = ids
                .iter()
                .map(|(k, v)| format!("{} = {}", qi(k), literal(v)))
                .collect();
            if sets.is_empty() {
                continue;
            }
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = {}",
                source_ident,
                sets.join(", "),
                qi(source_row_id_column),
                fb.source_row_id
            );
            client
                .update(&sql, None, &[])
                .unwrap_or_else(|e| pgrx::error!("Failed to write back assigned id: {}", e));
        }
    });
}

// ── Session-scoped feedback table ──

fn ensure_feedback_temp_table() {
    Spi::connect_mut(|client| {
        client
            .update(
                r#"
                CREATE TEMP TABLE IF NOT EXISTS pg_temp.temporal_merge_feedback (
                    source_row_id bigint NOT NULL,
                    status temporal.temporal_merge_feedback_status NOT NULL,
                    assigned_entity_ids jsonb,
                    error_message text
                ) ON COMMIT DROP
                "#,
                None,
                &[],
            )
            .unwrap_or_else(|e| pgrx::error!("Failed to create feedback temp table: {}", e));
        client
            .update("TRUNCATE pg_temp.temporal_merge_feedback", None, &[])
            .unwrap_or_else(|e| pgrx::error!("Failed to truncate feedback temp table: {}", e));
    });
}

fn emit_feedback_rows(feedback: &[FeedbackRow]) -> i64 {
    if feedback.is_empty() {
        return 0;
    }
    let values: Vec<String> = feedback
        .iter()
        .map(|fb| {
            let status = format!("'{}'::temporal.temporal_merge_feedback_status", fb.status.as_str());
            let ids = match &fb.assigned_entity_ids {
                Some(v) => format!(
                    "'{}'::jsonb",
                    serde_json::to_string(v).unwrap_or_default().replace('\'', "''")
                ),
                None => "NULL".to_string(),
            };
            let err = match &fb.error_message {
                Some(m) => format!("'{}'", m.replace('\'', "''")),
                None => "NULL".to_string(),
            };
            format!("({}, {}, {}, {})", fb.source_row_id, status, ids, err)
        })
        .collect();

    Spi::connect_mut(|client| {
        let sql = format!(
            "INSERT INTO pg_temp.temporal_merge_feedback (source_row_id, status, assigned_entity_ids, error_message) VALUES {}",
            values.join(", ")
        );
        client
            .update(&sql, None, &[])
            .unwrap_or_else(|e| pgrx::error!("Failed to insert feedback rows: {}", e));
    });

    feedback.len() as i64
}

// ── Tests ──

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use super::*;
    use crate::types::{AllenRelation, DeleteMode, EraMetadata, IdentityStrategy, MergeMode};

    fn test_ctx() -> PlannerContext {
        PlannerContext {
            mode: MergeMode::MergeEntityUpsert,
            delete_mode: DeleteMode::None,
            era: EraMetadata {
                range_col: String::new(),
                valid_from_col: "valid_from".to_string(),
                valid_until_col: "valid_until".to_string(),
                valid_to_col: None,
                range_type: "daterange".to_string(),
                multirange_type: "datemultirange".to_string(),
                range_subtype: "date".to_string(),
                range_subtype_category: 'D',
                ephemeral_columns: vec![],
            },
            identity_columns: vec!["id".to_string()],
            all_lookup_cols: vec![],
            lookup_key_sets: vec![],
            original_entity_key_cols: vec![],
            original_entity_segment_key_cols: vec![],
            temporal_cols: vec![],
            pk_cols: vec![],
            strategy: IdentityStrategy::IdentityKeyOnly,
            ephemeral_columns: vec![],
            founding_id_column: Some("founding_id".to_string()),
            row_id_column: "row_id".to_string(),
            log_trace: false,
            exclude_if_null_columns: Default::default(),
        }
    }

    #[pg_test]
    fn test_build_where_uses_entity_keys_and_bounds() {
        let ctx = test_ctx();
        let founding = FoundingMap::new();
        let row = PlanRow {
            plan_op_seq: 1,
            statement_seq: 1,
            row_ids: vec![1],
            operation: PlanAction::Update,
            update_effect: None,
            causal_id: None,
            is_new_entity: false,
            entity_keys: Some(serde_json::json!({"id": 7})),
            identity_keys: Some(serde_json::json!({"id": 7})),
            lookup_keys: None,
            s_t_relation: Some(AllenRelation::Equals),
            b_a_relation: None,
            old_valid_from: Some("2024-01-01".to_string()),
            old_valid_until: Some("2024-06-01".to_string()),
            new_valid_from: Some("2024-01-01".to_string()),
            new_valid_until: Some("2024-12-01".to_string()),
            old_valid_range: None,
            new_valid_range: None,
            data: Some(serde_json::json!({"name": "Alice"})),
            feedback: None,
            trace: None,
            grouping_key: "g".to_string(),
        };
        let clause = build_where(&row, &ctx, &founding);
        assert!(clause.contains("\"id\" = '7'"));
        assert!(clause.contains("\"valid_from\" = '2024-01-01'::date"));
    }

    #[pg_test]
    fn test_apply_founding_fills_missing_identity() {
        let ctx = test_ctx();
        let mut founding = FoundingMap::new();
        let mut vals = serde_json::Map::new();
        vals.insert("id".to_string(), serde_json::json!(42));
        founding.insert("grp-1".to_string(), vals);

        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), Value::Null);
        apply_founding(&mut map, &Some("grp-1".to_string()), &ctx, &founding);
        assert_eq!(map.get("id"), Some(&serde_json::json!(42)));
    }

    #[pg_test]
    fn test_skip_no_target_maps_to_target_not_found() {
        let mut feedback = Vec::new();
        let row = PlanRow {
            plan_op_seq: 1,
            statement_seq: 0,
            row_ids: vec![5],
            operation: PlanAction::SkipNoTarget,
            update_effect: None,
            causal_id: Some("c1".to_string()),
            is_new_entity: false,
            entity_keys: None,
            identity_keys: None,
            lookup_keys: None,
            s_t_relation: None,
            b_a_relation: None,
            old_valid_from: None,
            old_valid_until: None,
            new_valid_from: None,
            new_valid_until: None,
            old_valid_range: None,
            new_valid_range: None,
            data: None,
            feedback: Some(serde_json::json!({"info": "filtered"})),
            trace: None,
            grouping_key: String::new(),
        };
        push_non_dml_feedback(&mut feedback, &row);
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].status, FeedbackStatus::TargetNotFound);
        assert_eq!(feedback[0].source_row_id, 5);
    }
}
