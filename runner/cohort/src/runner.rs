//! 程序运行函数.

use lc_berry::consts::RECORDS_FILENAME;
use lc_berry::pipeline::{ensure_output_dirs, run_cohort, PipelineError, RunOptions};
use lc_berry::registration::{NativeBackend, RegistrationBackend};
use utils::loader;

use crate::result::CohortResult;
use crate::Args;

/// 实际运行.
pub fn run(args: &Args) -> Result<CohortResult, PipelineError> {
    let mut config = loader::load_config(args.config.as_deref())?;
    if let Some(out) = args.output.as_ref() {
        config.output_dir = out.clone();
    }
    ensure_output_dirs(&config)?;

    let options = RunOptions {
        subjects: (!args.subjects.is_empty()).then(|| args.subjects.clone()),
        skip_registration: args.skip_registration,
    };
    let backend = NativeBackend;
    log::info!(
        "data: {}, output: {}, backend: {}, {} cpus",
        config.data_dir.display(),
        config.output_dir.display(),
        backend.name(),
        utils::cpus()
    );

    let report = run_cohort(&config, &backend, &options)?;
    let csv_path = config.output_dir.join(RECORDS_FILENAME);
    report.write_csv(&csv_path)?;
    log::info!("{} records written to {}", report.records.len(), csv_path.display());

    Ok(CohortResult::new(report, csv_path))
}
