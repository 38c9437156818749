use temporal_core as _;

pgrx::pg_binary_magic!();
