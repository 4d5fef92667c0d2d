pub mod backfill;
pub mod completions;
pub mod counters;
pub mod ingest;
pub mod validate;

use subtally_core::schema::Kind;

/// Kinds named with `--kind`, in first-mention order; all kinds when none.
pub fn selected_kinds(requested: &[Kind]) -> Vec<Kind> {
    if requested.is_empty() {
        return Kind::ALL.to_vec();
    }
    let mut kinds = Vec::with_capacity(requested.len());
    for kind in requested {
        if !kinds.contains(kind) {
            kinds.push(*kind);
        }
    }
    kinds
}
