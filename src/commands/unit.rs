use std::path::Path;

use anyhow::Context;
use pea::runtime::BackendFactory;
use pea::{supervise, Signal, UnitSpec};

/// Supervises the unit described by `spec` in this process.
///
/// Returns whether the unit ended without a failure.
pub(crate) async fn cmd_unit(
    spec: &Path,
    ready_file: &Path,
    shutdown_file: &Path,
) -> anyhow::Result<bool> {
    let ready = Signal::file_backed(ready_file);
    let shutdown = Signal::file_backed(shutdown_file);

    let spec = match UnitSpec::load(spec).with_context(|| format!("cannot read unit spec {}", spec.display())) {
        Ok(spec) => spec,
        Err(e) => {
            // The parent is waiting on these signals.
            shutdown.set();
            return Err(e);
        }
    };

    let span = tracing::info_span!(
        "pea",
        unit = %spec.config.name,
        backend = %spec.config.backend,
        pid = std::process::id()
    );
    let outcome = supervise(
        &spec.config,
        &span,
        &BackendFactory::new(),
        &spec.addresses,
        &ready,
        &shutdown,
    )
    .await;
    Ok(!outcome.phase.is_failure() && !outcome.teardown_failed)
}
