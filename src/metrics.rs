use tracing::trace;

// Trace-based counters; a metrics backend can subscribe on the
// `lotscout.metrics` target without the pipeline linking a recorder.

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "lotscout.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn source_quotes(source: &str, count: usize) {
    trace!(
        target = "lotscout.metrics",
        source = source,
        count = count,
        "source_quotes"
    );
}

pub fn item_state(state: &'static str) {
    trace!(target = "lotscout.metrics", state = state, "item_state_inc");
}
