//! GUC-backed configuration (spec §9 "options threaded as an immutable
//! configuration struct" — the GUCs here supply the *defaults* for that
//! struct; once read into a `PlannerContext`/call they don't change mid-call).

use std::ffi::CStr;

use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};

/// Era name used when a caller doesn't name one explicitly.
pub static DEFAULT_ERA_NAME: GucSetting<Option<&'static CStr>> =
    GucSetting::<Option<&'static CStr>>::new(Some(c"valid"));

/// Row count per batch `INSERT` when emitting plan rows (`lib.rs::emit_plan_rows`).
/// The teacher hardcodes this at 500; exposing it as a GUC lets large plans on
/// constrained connections lower it without a recompile.
pub static BATCH_CHUNK_SIZE: GucSetting<i32> = GucSetting::<i32>::new(500);

/// Default for `p_log_trace` on `temporal_merge_plan_native` and friends, so
/// trace logging can be turned on cluster- or session-wide without editing
/// every call site.
pub static LOG_TRACE: GucSetting<bool> = GucSetting::<bool>::new(false);

pub fn init() {
    GucRegistry::define_string_guc(
        "temporal.default_era_name",
        "Era name used when a caller does not pass one explicitly.",
        "Applies to temporal_merge_plan_native.",
        &DEFAULT_ERA_NAME,
        GucContext::Userset,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        "temporal.batch_chunk_size",
        "Row count per batched INSERT when the planner emits plan rows.",
        "Lower this on connections with small work_mem or statement size limits.",
        &BATCH_CHUNK_SIZE,
        1,
        100_000,
        GucContext::Userset,
        GucFlags::default(),
    );

    GucRegistry::define_bool_guc(
        "temporal.log_trace",
        "Default for p_log_trace when a caller omits it.",
        "Emits one pgrx::debug1! line per sweep phase; leave off in production.",
        &LOG_TRACE,
        GucContext::Userset,
        GucFlags::default(),
    );
}

/// Current `temporal.default_era_name`, as an owned `String`.
pub fn default_era_name() -> String {
    DEFAULT_ERA_NAME
        .get()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "valid".to_string())
}

pub fn batch_chunk_size() -> usize {
    BATCH_CHUNK_SIZE.get().max(1) as usize
}

pub fn log_trace_default() -> bool {
    LOG_TRACE.get()
}
