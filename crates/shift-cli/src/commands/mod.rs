pub mod coordinate;
pub mod files;
pub mod moves;

use shift_core::ShiftConfig;
use shift_engine::ShiftContext;
use tokio_util::sync::CancellationToken;

/// Context with the real collaborators, sharing the interrupt token.
pub fn context(config: ShiftConfig, cancel: CancellationToken) -> anyhow::Result<ShiftContext> {
    Ok(ShiftContext::builder(config).cancel(cancel).build()?)
}
