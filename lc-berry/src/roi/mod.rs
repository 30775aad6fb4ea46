//! 模板空间中的目标区 (LC ROI) 与参考区掩膜.
//!
//! 参考区按如下优先级获得:
//!
//! 1. 配置中显式给出的 `custom_reference_path`. 文件不存在视为错误;
//! 2. 图谱目录下的 `reference_roi_filename`, 若存在;
//! 3. 以 `reference_center_mni` 为球心、`reference_radius_mm` 为半径的几何球,
//!    扣除图谱中概率高于 `exclusion_threshold` 的体素. 生成后写到第 2 项的位置, 下次直接读入.
//!
//! 任何情况下都不会以 ROI 自身充当参考区.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{Grid, GridAttr, Idx3d, Mask, PipelineConfig, Point3, Volume, VolumeError};

mod sphere;

pub use sphere::SphereGenerator;

/// ROI / 参考区构造错误.
#[derive(Debug, Error)]
pub enum RoiError {
    /// 扣除后区域为空, 或球与网格不相交.
    #[error("region is empty: {0}")]
    EmptyRegion(String),

    /// 显式指定的掩膜文件不存在.
    #[error("mask file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// 掩膜网格与图谱网格不一致.
    #[error("mask grid {found:?} does not match atlas grid {expected:?}")]
    GridMismatch {
        /// 图谱形状.
        expected: Idx3d,
        /// 掩膜形状.
        found: Idx3d,
    },

    /// 读写失败.
    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// 将概率图谱按 `threshold` 二值化 (严格大于).
#[inline]
pub fn threshold_atlas(atlas: &Volume, threshold: f64) -> Mask {
    Mask::threshold(atlas, threshold)
}

/// 在 `grid` 上构造以物理坐标 `center` (mm) 为球心、`radius_mm` 为半径的球形掩膜,
/// 并扣除 `exclude` 中被选中的体素.
///
/// `exclude` 须与 `grid` 一致, 否则返回 [`RoiError::GridMismatch`].
/// 扣除后不剩任何体素时返回 [`RoiError::EmptyRegion`].
pub fn create_geometric_reference(
    grid: &Grid,
    exclude: &Mask,
    center: Point3,
    radius_mm: f64,
) -> Result<Mask, RoiError> {
    if !exclude.grid().same_as(grid) {
        return Err(RoiError::GridMismatch {
            expected: grid.shape(),
            found: exclude.shape(),
        });
    }
    let ball = SphereGenerator::new(grid, center).extract(radius_mm);
    if ball.is_empty() {
        return Err(RoiError::EmptyRegion(format!(
            "sphere at {center:?} mm (r = {radius_mm} mm) misses the grid"
        )));
    }
    let sphere_len = ball.len();
    let (mask, removed) = Mask::from_positions(*grid, ball).subtract(exclude);
    log::debug!("reference sphere: {sphere_len} voxels, {removed} excluded");
    if mask.is_empty() {
        return Err(RoiError::EmptyRegion(format!(
            "all {sphere_len} sphere voxels are covered by the exclusion mask"
        )));
    }
    Ok(mask)
}

/// 读入掩膜文件, 二值化并检查其与图谱同网格.
fn load_reference(path: &Path, atlas: &Volume, threshold: f64) -> Result<Mask, RoiError> {
    let volume = Volume::open(path)?;
    if !volume.same_grid(atlas) {
        return Err(RoiError::GridMismatch {
            expected: atlas.shape(),
            found: volume.shape(),
        });
    }
    let mask = Mask::threshold(&volume, threshold);
    if mask.is_empty() {
        return Err(RoiError::EmptyRegion(format!(
            "{} has no voxel above {threshold}",
            path.display()
        )));
    }
    log::info!("reference loaded from {} ({} voxels)", path.display(), mask.count());
    Ok(mask)
}

/// 按优先级获得参考区掩膜, 结果总是位于 `atlas` 的网格上.
pub fn load_or_create_reference(atlas: &Volume, config: &PipelineConfig) -> Result<Mask, RoiError> {
    if let Some(path) = config.custom_reference_path.as_deref() {
        if !path.is_file() {
            return Err(RoiError::NotFound(path.to_owned()));
        }
        return load_reference(path, atlas, config.reference_threshold);
    }

    let default_path = config.reference_roi_path();
    if default_path.is_file() {
        return load_reference(&default_path, atlas, config.reference_threshold);
    }

    log::info!(
        "no reference mask at {}, building a {} mm sphere at {:?}",
        default_path.display(),
        config.reference_radius_mm,
        config.reference_center_mni
    );
    let exclude = threshold_atlas(atlas, config.exclusion_threshold);
    let reference = create_geometric_reference(
        atlas.grid(),
        &exclude,
        config.reference_center_mni,
        config.reference_radius_mm,
    )?;

    // 写出失败不影响本次运行.
    let saved = fs::create_dir_all(&config.atlas_dir)
        .map_err(|e| e.to_string())
        .and_then(|_| save_reference(&reference, &default_path).map_err(|e| e.to_string()));
    match saved {
        Ok(()) => log::info!("reference saved to {}", default_path.display()),
        Err(e) => log::warn!("cannot save reference to {}: {e}", default_path.display()),
    }
    Ok(reference)
}

/// 将掩膜以 0/1 体数据写出.
pub fn save_reference<P: AsRef<Path>>(mask: &Mask, path: P) -> Result<(), RoiError> {
    mask.to_volume().save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Affine;
    use ndarray::Array3;

    fn grid() -> Grid {
        // 1 mm 各向同性, 体素 (10, 10, 10) 位于原点.
        Grid::new((21, 21, 21), Affine::axis_aligned([1.0; 3], [-10.0; 3]))
    }

    /// 以原点为中心、边长 `side` 的立方体为高概率区.
    fn atlas(side: usize) -> Volume {
        let lo = 10 - side / 2;
        let data = Array3::from_shape_fn((21, 21, 21), |(i, j, k)| {
            let inside = [i, j, k].iter().all(|v| (lo..lo + side).contains(v));
            if inside {
                0.9
            } else {
                0.0
            }
        });
        Volume::new(grid(), data).unwrap()
    }

    #[test]
    fn test_reference_excludes_roi() {
        let a = atlas(3);
        let roi = threshold_atlas(&a, 0.5);
        assert_eq!(roi.count(), 27);

        let reference = create_geometric_reference(a.grid(), &roi, [0.0; 3], 3.0).unwrap();
        assert!(reference.is_disjoint(&roi));
        // 半径 3 的离散球共 123 个体素, 其中 27 个被 3x3x3 立方体占据.
        assert_eq!(reference.count(), 123 - 27);
    }

    #[test]
    fn test_reference_swallowed_by_exclusion() {
        let a = atlas(9);
        let exclude = threshold_atlas(&a, 0.1);
        let e = create_geometric_reference(a.grid(), &exclude, [0.0; 3], 3.0).unwrap_err();
        assert!(matches!(e, RoiError::EmptyRegion(_)));
    }

    #[test]
    fn test_reference_grid_mismatch() {
        let a = atlas(3);
        let other = Mask::empty(Grid::new((20, 21, 21), *grid().affine()));
        let e = create_geometric_reference(a.grid(), &other, [0.0; 3], 3.0).unwrap_err();
        assert!(matches!(e, RoiError::GridMismatch { .. }));
    }

    #[test]
    fn test_load_or_create_priority() {
        let dir = tempfile::tempdir().unwrap();
        let a = atlas(3);
        let mut config = PipelineConfig {
            atlas_dir: dir.path().to_owned(),
            reference_center_mni: [0.0; 3],
            ..Default::default()
        };

        // 没有任何文件: 几何球.
        let sphere = load_or_create_reference(&a, &config).unwrap();
        assert_eq!(sphere.count(), 96);

        // 几何球已写到默认路径, 再次调用时读回同一掩膜.
        assert!(config.reference_roi_path().is_file());
        let reloaded = load_or_create_reference(&a, &config).unwrap();
        assert_eq!(reloaded.positions(), sphere.positions());

        // 默认路径存在时优先读入.
        let slab = Mask::from_positions(*a.grid(), [(0, 0, 0), (0, 0, 1)]);
        save_reference(&slab, config.reference_roi_path()).unwrap();
        let loaded = load_or_create_reference(&a, &config).unwrap();
        assert_eq!(loaded.positions(), vec![(0, 0, 0), (0, 0, 1)]);

        // 显式路径不存在: 报错, 而不是回退.
        config.custom_reference_path = Some(dir.path().join("missing.nii.gz"));
        let e = load_or_create_reference(&a, &config).unwrap_err();
        assert!(matches!(e, RoiError::NotFound(_)));
    }
}
