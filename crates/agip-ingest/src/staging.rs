//! Raw load and staging rebuild for one dataset.

use agip_core::{Batch, SourceArtifact};
use agip_storage::{RawLoad, WarehouseTx};
use agip_transform::{read_csv_snapshot, StagingOutput, TransformError};
use std::path::Path;
use tracing::info;

use crate::registry::PreparedDataset;
use crate::PipelineError;

/// Replaces the raw table with the snapshot verbatim, then rebuilds the
/// staging table through the dataset's program.
pub async fn stage_dataset<T: WarehouseTx>(
    tx: &mut T,
    dataset: &PreparedDataset,
    batch: Batch,
    artifact: &SourceArtifact,
) -> Result<StagingOutput, PipelineError> {
    let spec = &dataset.spec;
    let transform_err = |source: TransformError| PipelineError::Transform {
        dataset: spec.name.clone(),
        source,
    };

    let raw = read_csv_snapshot(Path::new(&artifact.local_path)).map_err(transform_err)?;
    let raw_rows = tx
        .replace_raw_table(
            &spec.raw_table,
            RawLoad {
                run_id: batch.run_id,
                batch_id: batch.batch_id,
                pulled_at: artifact.downloaded_at,
                snapshot: &raw,
            },
        )
        .await?;

    let output = dataset.program.apply(&raw).map_err(transform_err)?;
    let staged_rows = tx
        .replace_staging_table(&spec.staging_table, dataset.program.layout(), &output.rows)
        .await?;
    info!(
        dataset = %spec.name,
        raw_table = %spec.raw_table,
        staging_table = %spec.staging_table,
        raw_rows,
        staged_rows,
        broken_keys = output.broken_keys,
        "staging rebuilt"
    );
    Ok(output)
}
