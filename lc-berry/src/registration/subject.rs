use std::collections::BTreeMap;
use std::fs;

use super::{Interpolation, RegistrationBackend, RegistrationError, RegistrationParams, Transform};
use crate::dataset::discover_subject;
use crate::{PipelineConfig, Volume};

/// 单个被试配准到模板空间后的结果.
#[derive(Debug, Clone)]
pub struct RegisteredSubject {
    /// 被试编号.
    pub subject_id: String,

    /// 主结构像到模板的变换. 从已有输出读入时为 `None`.
    pub transform: Option<Transform>,

    /// 对比度名 -> 模板空间中的体数据. 包括主结构像本身.
    pub contrasts: BTreeMap<String, Volume>,

    /// 未找到或无法变换而被跳过的对比度, 保持配置顺序.
    pub skipped: Vec<String>,
}

impl RegisteredSubject {
    /// 将各对比度写入 `<output_dir>/<sub>/<sub>_<contrast>_MNI.nii.gz`.
    pub fn save(&self, config: &PipelineConfig) -> Result<(), RegistrationError> {
        let dir = config.subject_output_dir(&self.subject_id);
        fs::create_dir_all(&dir).map_err(|source| RegistrationError::Io {
            path: dir.clone(),
            source,
        })?;
        for (name, volume) in self.contrasts.iter() {
            volume.save(config.warped_path(&self.subject_id, name))?;
        }
        Ok(())
    }
}

/// 对被试 `subject_id` 执行完整配准: 定位主结构像, 配准到 `fixed`,
/// 再以线性插值将同一变换作用于其他已配置的对比度.
///
/// 主结构像缺失时返回 [`RegistrationError::MissingInput`]. 其他对比度缺失
/// (或其网格与主结构像不一致) 时记录警告并跳过, 不影响该被试的其余结果.
pub fn register_subject<B: RegistrationBackend + ?Sized>(
    subject_id: &str,
    fixed: &Volume,
    config: &PipelineConfig,
    backend: &B,
) -> Result<RegisteredSubject, RegistrationError> {
    let params = RegistrationParams::from_settings(&config.registration)?;
    let record = discover_subject(&config.data_dir, subject_id, config);

    let primary = config.primary_contrast.as_str();
    let Some(primary_path) = record.get(primary) else {
        return Err(RegistrationError::MissingInput {
            subject_id: subject_id.to_owned(),
            contrast: primary.to_owned(),
        });
    };
    let moving = Volume::open(primary_path)?;

    log::info!(
        "[{subject_id}] registering {} with `{}` backend ({:?}, {:?})",
        primary_path.display(),
        backend.name(),
        params.kind,
        params.metric
    );
    let transform = backend.register(&moving, fixed, &params)?;

    let mut contrasts = BTreeMap::new();
    contrasts.insert(
        primary.to_owned(),
        transform.apply(&moving, Interpolation::Linear)?,
    );

    let mut skipped = Vec::new();
    for c in config.secondary_contrasts() {
        let Some(path) = record.get(&c.name) else {
            log::warn!(
                "[{subject_id}] no file matches {:?}, skipping `{}`",
                c.patterns,
                c.name
            );
            skipped.push(c.name.clone());
            continue;
        };
        let warped = Volume::open(path).map_err(RegistrationError::from).and_then(|v| {
            transform.apply(&v, Interpolation::Linear)
        });
        match warped {
            Ok(v) => {
                contrasts.insert(c.name.clone(), v);
            }
            Err(e) => {
                log::warn!("[{subject_id}] skipping `{}`: {e}", c.name);
                skipped.push(c.name.clone());
            }
        }
    }

    Ok(RegisteredSubject {
        subject_id: subject_id.to_owned(),
        transform: Some(transform),
        contrasts,
        skipped,
    })
}

/// 读入先前由 [`RegisteredSubject::save`] 写出的模板空间体数据, 跳过配准.
///
/// 主结构像的输出缺失时返回 [`RegistrationError::MissingInput`].
pub fn load_registered_subject(
    subject_id: &str,
    config: &PipelineConfig,
) -> Result<RegisteredSubject, RegistrationError> {
    let mut contrasts = BTreeMap::new();
    let mut skipped = Vec::new();
    for c in config.contrast_patterns.iter() {
        let path = config.warped_path(subject_id, &c.name);
        if !path.is_file() {
            if c.name == config.primary_contrast {
                return Err(RegistrationError::MissingInput {
                    subject_id: subject_id.to_owned(),
                    contrast: c.name.clone(),
                });
            }
            log::warn!("[{subject_id}] no warped `{}` under {}", c.name, path.display());
            skipped.push(c.name.clone());
            continue;
        }
        contrasts.insert(c.name.clone(), Volume::open(&path)?);
    }
    log::info!(
        "[{subject_id}] reusing {} warped contrasts",
        contrasts.len()
    );

    Ok(RegisteredSubject {
        subject_id: subject_id.to_owned(),
        transform: None,
        contrasts,
        skipped,
    })
}
