//! 队列级流程: 准备模板空间掩膜, 逐被试配准与定量, 汇总结果.
//!
//! 被试之间相互独立. 开启 `rayon` feature 时并行处理, 共享的图谱掩膜和模板只读.
//! 单个被试 (或单个对比度) 的失败会被记录并跳过, 不影响其他被试.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::dataset::{list_processed_subjects, list_subjects, DiscoveryError};
use crate::extract::{compute_cnr_with_tolerance, sort_records, write_records, ExtractError, ExtractionRecord};
use crate::registration::{
    load_registered_subject, register_subject, RegisteredSubject, RegistrationBackend, RegistrationError,
};
use crate::roi::{load_or_create_reference, threshold_atlas, RoiError};
use crate::{ConfigError, GridAttr, Idx3d, Mask, PipelineConfig, Volume, VolumeError};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// 队列级错误. 这些错误使整个运行无法继续.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 配置错误.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 数据目录错误.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// 配准错误.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// 掩膜构造错误.
    #[error(transparent)]
    Roi(#[from] RoiError),

    /// 掩膜校验错误.
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// 图谱或模板读取错误.
    #[error(transparent)]
    Volume(#[from] VolumeError),

    /// 没有可处理的被试.
    #[error("no subject to process under {}", .0.display())]
    EmptyCohort(PathBuf),

    /// 输出目录不存在.
    #[error("output directory {} does not exist", .0.display())]
    OutputDirMissing(PathBuf),

    /// 模板与图谱不在同一网格上.
    #[error("template grid {template:?} does not match atlas grid {atlas:?}")]
    GridMismatch {
        /// 模板形状.
        template: Idx3d,
        /// 图谱形状.
        atlas: Idx3d,
    },

    /// 写结果表失败.
    #[error("cannot write records: {0}")]
    Csv(#[from] csv::Error),

    /// 创建目录失败.
    #[error("cannot create {}: {source}", path.display())]
    Io {
        /// 目录.
        path: PathBuf,
        /// 底层错误.
        source: std::io::Error,
    },
}

/// 创建输出目录与图像目录. 由调用者在运行前显式调用.
pub fn ensure_output_dirs(config: &PipelineConfig) -> Result<(), PipelineError> {
    for dir in [&config.output_dir, &config.figures_dir] {
        fs::create_dir_all(dir).map_err(|source| PipelineError::Io {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}

/// 模板空间中所有被试共用的掩膜.
#[derive(Debug, Clone)]
pub struct CohortMasks {
    /// 蓝斑核概率图谱.
    pub atlas: Volume,
    /// 二值化后的 ROI.
    pub roi: Mask,
    /// 参考区.
    pub reference: Mask,
}

impl CohortMasks {
    /// 读入图谱, 构造 ROI 与参考区, 并检查两者非空且不相交.
    pub fn prepare(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let atlas = Volume::open(config.lc_atlas_path())?;
        let roi = threshold_atlas(&atlas, config.lc_probability_threshold);
        if roi.is_empty() {
            return Err(ExtractError::EmptyRoi("ROI").into());
        }
        let reference = load_or_create_reference(&atlas, config)?;

        let overlap = roi.overlap_count(&reference);
        if overlap > config.max_mask_overlap {
            return Err(ExtractError::MaskOverlap {
                overlap,
                tolerance: config.max_mask_overlap,
            }
            .into());
        }
        log::info!(
            "ROI: {} voxels, reference: {} voxels ({} mm^3 per voxel)",
            roi.count(),
            reference.count(),
            atlas.voxel_volume()
        );
        Ok(Self {
            atlas,
            roi,
            reference,
        })
    }
}

/// 运行选项.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// 只处理这些被试. `None` 表示全部.
    pub subjects: Option<Vec<String>>,

    /// 复用已写出的配准结果, 不再配准.
    pub skip_registration: bool,
}

/// 单个被试 (或其某个对比度) 的失败记录.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectFailure {
    /// 被试编号.
    pub subject_id: String,
    /// 出错的对比度. `None` 表示整个被试失败.
    pub contrast: Option<String>,
    /// 原因.
    pub reason: String,
}

/// 一次队列运行的结果.
#[derive(Debug, Clone, Default)]
pub struct CohortReport {
    /// 处理的被试个数.
    pub subjects: usize,
    /// 定量结果, 按 (被试, 对比度) 排序.
    pub records: Vec<ExtractionRecord>,
    /// 失败记录, 按被试排序.
    pub failures: Vec<SubjectFailure>,
}

impl CohortReport {
    /// 以 CSV 格式写出定量结果.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), PipelineError> {
        write_records(path, &self.records)?;
        Ok(())
    }

    /// 至少产生了一条结果的被试个数.
    pub fn succeeded_subjects(&self) -> usize {
        let mut ids: Vec<_> = self.records.iter().map(|r| r.subject_id.as_str()).collect();
        ids.dedup();
        ids.len()
    }
}

/// 单个被试的处理结果.
#[derive(Default)]
struct SubjectOutcome {
    records: Vec<ExtractionRecord>,
    failures: Vec<SubjectFailure>,
}

fn failure(subject_id: &str, contrast: Option<&str>, reason: impl ToString) -> SubjectFailure {
    SubjectFailure {
        subject_id: subject_id.to_owned(),
        contrast: contrast.map(str::to_owned),
        reason: reason.to_string(),
    }
}

/// 对已位于模板空间的各对比度计算 CNR.
fn quantify(reg: &RegisteredSubject, masks: &CohortMasks, config: &PipelineConfig) -> SubjectOutcome {
    let id = reg.subject_id.as_str();
    let mut out = SubjectOutcome::default();
    for (name, volume) in reg.contrasts.iter() {
        match compute_cnr_with_tolerance(volume, &masks.roi, &masks.reference, config.max_mask_overlap) {
            Ok(stats) => {
                log::debug!("[{id}] {name}: cnr {:.4}, cr {:.4}", stats.cnr, stats.cr);
                out.records.push(ExtractionRecord::new(id, name, &stats));
            }
            Err(e) => {
                log::error!("[{id}] {name}: {e}");
                out.failures.push(failure(id, Some(name.as_str()), e));
            }
        }
    }
    out
}

/// 单个被试的完整处理: 配准 (或读入已有结果), 写出, 定量.
fn process_subject<B: RegistrationBackend + ?Sized>(
    subject_id: &str,
    template: Option<&Volume>,
    masks: &CohortMasks,
    config: &PipelineConfig,
    backend: &B,
) -> SubjectOutcome {
    let registered = match template {
        Some(fixed) => register_subject(subject_id, fixed, config, backend),
        None => load_registered_subject(subject_id, config),
    };
    let reg = match registered {
        Ok(reg) => reg,
        Err(e) => {
            log::error!("[{subject_id}] {e}");
            return SubjectOutcome {
                records: vec![],
                failures: vec![failure(subject_id, None, e)],
            };
        }
    };

    if template.is_some() && config.save_warped {
        if let Err(e) = reg.save(config) {
            log::warn!("[{subject_id}] cannot save warped contrasts: {e}");
        }
    }
    let out = quantify(&reg, masks, config);
    log::info!(
        "[{subject_id}] {} records, {} contrasts skipped",
        out.records.len(),
        reg.skipped.len()
    );
    out
}

/// 处理整个队列.
///
/// 图谱或模板缺失、模板与图谱网格不一致、没有被试、输出目录不存在都是致命错误.
/// 其余错误按被试记录在 [`CohortReport::failures`] 中.
pub fn run_cohort<B: RegistrationBackend + ?Sized>(
    config: &PipelineConfig,
    backend: &B,
    options: &RunOptions,
) -> Result<CohortReport, PipelineError> {
    if !config.output_dir.is_dir() {
        return Err(PipelineError::OutputDirMissing(config.output_dir.clone()));
    }
    let masks = CohortMasks::prepare(config)?;

    let template = if options.skip_registration {
        None
    } else {
        let template = Volume::open(config.template_path())?;
        if !template.same_grid(&masks.atlas) {
            return Err(PipelineError::GridMismatch {
                template: template.shape(),
                atlas: masks.atlas.shape(),
            });
        }
        Some(template)
    };

    let (root, mut subjects) = if options.skip_registration {
        (&config.output_dir, list_processed_subjects(&config.output_dir)?)
    } else {
        (&config.data_dir, list_subjects(&config.data_dir)?)
    };
    if let Some(wanted) = options.subjects.as_ref() {
        subjects.retain(|s| wanted.contains(s));
    }
    if subjects.is_empty() {
        return Err(PipelineError::EmptyCohort(root.clone()));
    }
    log::info!("processing {} subjects", subjects.len());

    let run = |s: &String| process_subject(s, template.as_ref(), &masks, config, backend);
    #[cfg(feature = "rayon")]
    let outcomes: Vec<SubjectOutcome> = subjects.par_iter().map(run).collect();
    #[cfg(not(feature = "rayon"))]
    let outcomes: Vec<SubjectOutcome> = subjects.iter().map(run).collect();

    let mut report = CohortReport {
        subjects: subjects.len(),
        ..Default::default()
    };
    for out in outcomes {
        report.records.extend(out.records);
        report.failures.extend(out.failures);
    }
    sort_records(&mut report.records);
    report
        .failures
        .sort_by(|a, b| (&a.subject_id, &a.contrast).cmp(&(&b.subject_id, &b.contrast)));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::compute_cnr;
    use crate::registration::NativeBackend;
    use crate::{Affine, Grid};
    use ndarray::Array3;

    const N: usize = 24;
    const CENTER: Idx3d = (12, 12, 12);

    /// 1 mm 网格, 体素 `CENTER` 位于默认参考区球心 (0, -30, -28).
    fn grid() -> Grid {
        Grid::new((N, N, N), Affine::axis_aligned([1.0; 3], [-12.0, -42.0, -40.0]))
    }

    fn dist2((i, j, k): Idx3d) -> usize {
        let (a, b, c) = CENTER;
        i.abs_diff(a).pow(2) + j.abs_diff(b).pow(2) + k.abs_diff(c).pow(2)
    }

    /// 概率图谱: 球心附近 `dist2 <= inner` 的体素, 加上远处若干体素, 共 120 个.
    fn atlas(inner: usize) -> Volume {
        let mut data = Array3::<f32>::zeros((N, N, N));
        let mut n = 0;
        for (p, v) in data.indexed_iter_mut() {
            if dist2(p) <= inner {
                *v = 0.9;
                n += 1;
            }
        }
        for (p, v) in data.indexed_iter_mut() {
            if n < 120 && p.0 >= 20 {
                *v = 0.9;
                n += 1;
            }
        }
        Volume::new(grid(), data).unwrap()
    }

    fn ramp() -> Volume {
        let data = Array3::from_shape_fn((N, N, N), |(i, _, _)| 1.0 + i as f32);
        Volume::new(grid(), data).unwrap()
    }

    /// ROI 取 `roi_value`, 参考区交替取 8 和 12, 其余为 100.
    fn contrast(masks: &CohortMasks, roi_value: f32) -> Volume {
        let mut data = Array3::from_elem((N, N, N), 100.0f32);
        for p in masks.roi.positions() {
            data[p] = roi_value;
        }
        for (n, p) in masks.reference.positions().into_iter().enumerate() {
            data[p] = if n % 2 == 0 { 8.0 } else { 12.0 };
        }
        Volume::new(grid(), data).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: PipelineConfig,
    }

    fn fixture(inner: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let mut config = PipelineConfig {
            data_dir: root.join("bids"),
            output_dir: root.join("out/results"),
            figures_dir: root.join("out/figures"),
            atlas_dir: root.join("atlases"),
            ..Default::default()
        };
        config.registration.registration_type = "Translation".to_owned();
        config.registration.reg_iterations = vec![1];

        fs::create_dir_all(&config.atlas_dir).unwrap();
        fs::create_dir_all(&config.data_dir).unwrap();
        atlas(inner).save(config.lc_atlas_path()).unwrap();
        ramp().save(config.template_path()).unwrap();
        Fixture { _dir: dir, config }
    }

    fn write_subject(config: &PipelineConfig, id: &str, files: &[(&str, &Volume)]) {
        let anat = config.data_dir.join(id).join("ses-01").join("anat");
        fs::create_dir_all(&anat).unwrap();
        for (suffix, v) in files {
            v.save(anat.join(format!("{id}_ses-01_{suffix}"))).unwrap();
        }
    }

    #[test]
    fn test_masks_and_scenarios() {
        let f = fixture(4);
        let masks = CohortMasks::prepare(&f.config).unwrap();
        assert_eq!(masks.roi.count(), 120);
        assert_eq!(masks.reference.count(), 90);
        assert!(masks.roi.is_disjoint(&masks.reference));

        // 无对比度.
        let s = compute_cnr(&contrast(&masks, 10.0), &masks.roi, &masks.reference).unwrap();
        assert_eq!((s.cnr, s.cr), (0.0, 0.0));

        // 正对比度.
        let s = compute_cnr(&contrast(&masks, 14.0), &masks.roi, &masks.reference).unwrap();
        assert_eq!(s.cnr, 2.0);
        assert!((s.cr - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_reference_swallowed() {
        // 图谱覆盖整个参考球.
        let f = fixture(9);
        let e = CohortMasks::prepare(&f.config).unwrap_err();
        assert!(matches!(e, PipelineError::Roi(RoiError::EmptyRegion(_))));
    }

    #[test]
    fn test_run_cohort_end_to_end() {
        // 其他测试可能已设置 logger.
        let _ = simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
        let f = fixture(4);
        let config = &f.config;
        ensure_output_dirs(config).unwrap();
        let masks = CohortMasks::prepare(config).unwrap();

        let t1 = ramp();
        let r1 = contrast(&masks, 14.0);
        write_subject(config, "sub-01", &[("T1w.nii.gz", &t1), ("R1map.nii.gz", &r1)]);
        write_subject(config, "sub-02", &[("R1map.nii.gz", &r1)]);

        let report = run_cohort(config, &NativeBackend, &RunOptions::default()).unwrap();
        assert_eq!(report.subjects, 2);
        assert_eq!(report.succeeded_subjects(), 1);

        let keys: Vec<_> = report
            .records
            .iter()
            .map(|r| (r.subject_id.as_str(), r.contrast_name.as_str()))
            .collect();
        assert_eq!(keys, [("sub-01", "R1"), ("sub-01", "T1w")]);
        let r1_record = &report.records[0];
        assert_eq!(r1_record.mean_ref, 10.0);
        assert_eq!(r1_record.std_ref, 2.0);
        assert_eq!(r1_record.cnr, 2.0);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subject_id, "sub-02");
        assert_eq!(report.failures[0].contrast, None);

        // 配准结果已写出, 可以跳过配准重新定量.
        assert!(config.warped_path("sub-01", "R1").is_file());
        let options = RunOptions {
            subjects: Some(vec!["sub-01".to_owned()]),
            skip_registration: true,
        };
        let again = run_cohort(config, &NativeBackend, &options).unwrap();
        assert_eq!(again.records, report.records);

        let csv_path = config.output_dir.join(crate::consts::RECORDS_FILENAME);
        report.write_csv(&csv_path).unwrap();
        assert_eq!(std::fs::read_to_string(&csv_path).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_fatal_errors() {
        let f = fixture(4);
        let e = run_cohort(&f.config, &NativeBackend, &RunOptions::default()).unwrap_err();
        assert!(matches!(e, PipelineError::OutputDirMissing(_)));

        ensure_output_dirs(&f.config).unwrap();
        let e = run_cohort(&f.config, &NativeBackend, &RunOptions::default()).unwrap_err();
        assert!(matches!(e, PipelineError::EmptyCohort(_)));

        let mut config = f.config.clone();
        config.lc_atlas_filename = "missing.nii.gz".to_owned();
        let e = CohortMasks::prepare(&config).unwrap_err();
        assert!(matches!(e, PipelineError::Volume(VolumeError::NotFound(_))));
    }
}
