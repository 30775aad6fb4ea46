//! 掩膜内强度统计与对比度噪声比.
//!
//! 定义:
//!
//! - `cnr = (mean_roi - mean_ref) / std_ref`
//! - `cr  = (mean_roi - mean_ref) / mean_ref`
//!
//! 标准差均为总体标准差. 非有限体素不参与统计. 任何不满足前提的输入都返回错误,
//! 不会产生占位数值.

use ordered_float::OrderedFloat;
use thiserror::Error;

use crate::{GridAttr, Idx3d, Mask, Volume};

mod record;

pub use record::{sort_records, write_records, ExtractionRecord};

/// 统计提取错误.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// 掩膜中没有任何有限值体素.
    #[error("{0} mask selects no finite voxel")]
    EmptyRoi(&'static str),

    /// 参考区标准差或均值为零, 比值无定义.
    #[error("degenerate reference: mean {mean}, std {std}")]
    DegenerateReference {
        /// 参考区均值.
        mean: f64,
        /// 参考区标准差.
        std: f64,
    },

    /// ROI 与参考区重叠体素数超出容许值.
    #[error("ROI and reference overlap in {overlap} voxels (tolerance {tolerance})")]
    MaskOverlap {
        /// 重叠体素数.
        overlap: usize,
        /// 容许值.
        tolerance: usize,
    },

    /// 体数据与掩膜不在同一网格上.
    #[error("{what} grid {found:?} does not match volume grid {expected:?}")]
    GridMismatch {
        /// 出错的对象.
        what: &'static str,
        /// 体数据形状.
        expected: Idx3d,
        /// 掩膜形状.
        found: Idx3d,
    },
}

/// 掩膜内强度的描述统计量.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiStats {
    /// 均值.
    pub mean: f64,
    /// 总体标准差.
    pub std: f64,
    /// 中位数.
    pub median: f64,
    /// 最小值.
    pub min: f64,
    /// 最大值.
    pub max: f64,
    /// 参与统计的体素个数.
    pub voxel_count: usize,
}

impl RoiStats {
    /// 由样本计算. 没有样本时返回 `None`.
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        values.sort_unstable_by_key(|v| OrderedFloat(*v));
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };
        Some(Self {
            mean,
            std: var.sqrt(),
            median,
            min: values[0],
            max: values[values.len() - 1],
            voxel_count: values.len(),
        })
    }
}

/// ROI 与参考区的对比统计.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CnrStats {
    /// ROI 均值.
    pub mean_roi: f64,
    /// ROI 标准差.
    pub std_roi: f64,
    /// 参考区均值.
    pub mean_ref: f64,
    /// 参考区标准差.
    pub std_ref: f64,
    /// 对比度噪声比.
    pub cnr: f64,
    /// 对比度比.
    pub cr: f64,
    /// ROI 有效体素数.
    pub roi_voxels: usize,
    /// 参考区有效体素数.
    pub ref_voxels: usize,
}

/// 收集 `mask` 选中的有限强度值.
fn masked_values(volume: &Volume, mask: &Mask) -> Vec<f64> {
    mask.positions()
        .into_iter()
        .map(|p| volume[p])
        .filter(|v| v.is_finite())
        .map(f64::from)
        .collect()
}

fn check_grid<G: GridAttr>(volume: &Volume, other: &G, what: &'static str) -> Result<(), ExtractError> {
    if volume.same_grid(other) {
        Ok(())
    } else {
        Err(ExtractError::GridMismatch {
            what,
            expected: volume.shape(),
            found: other.shape(),
        })
    }
}

/// 计算 `volume` 在 `mask_volume > threshold` 区域内的描述统计量.
pub fn extract_roi_stats(volume: &Volume, mask_volume: &Volume, threshold: f64) -> Result<RoiStats, ExtractError> {
    check_grid(volume, mask_volume, "mask")?;
    let mask = Mask::threshold(mask_volume, threshold);
    RoiStats::from_values(masked_values(volume, &mask)).ok_or(ExtractError::EmptyRoi("ROI"))
}

/// 计算 ROI 相对参考区的 CNR 与 CR. ROI 与参考区必须完全不相交.
#[inline]
pub fn compute_cnr(volume: &Volume, roi: &Mask, reference: &Mask) -> Result<CnrStats, ExtractError> {
    compute_cnr_with_tolerance(volume, roi, reference, 0)
}

/// 同 [`compute_cnr`], 但允许至多 `tolerance` 个重叠体素. 重叠体素只计入 ROI.
pub fn compute_cnr_with_tolerance(
    volume: &Volume,
    roi: &Mask,
    reference: &Mask,
    tolerance: usize,
) -> Result<CnrStats, ExtractError> {
    check_grid(volume, roi, "ROI")?;
    check_grid(volume, reference, "reference")?;

    let overlap = roi.overlap_count(reference);
    if overlap > tolerance {
        return Err(ExtractError::MaskOverlap { overlap, tolerance });
    }
    let reference = if overlap > 0 {
        log::warn!("{overlap} overlapping voxels dropped from the reference");
        reference.subtract(roi).0
    } else {
        reference.clone()
    };

    let r = RoiStats::from_values(masked_values(volume, roi)).ok_or(ExtractError::EmptyRoi("ROI"))?;
    let b = RoiStats::from_values(masked_values(volume, &reference))
        .ok_or(ExtractError::EmptyRoi("reference"))?;
    if b.std == 0.0 || b.mean == 0.0 {
        return Err(ExtractError::DegenerateReference {
            mean: b.mean,
            std: b.std,
        });
    }

    let diff = r.mean - b.mean;
    Ok(CnrStats {
        mean_roi: r.mean,
        std_roi: r.std,
        mean_ref: b.mean,
        std_ref: b.std,
        cnr: diff / b.std,
        cr: diff / b.mean,
        roi_voxels: r.voxel_count,
        ref_voxels: b.voxel_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Affine, Grid};
    use ndarray::Array3;

    fn grid() -> Grid {
        Grid::new((10, 10, 10), Affine::axis_aligned([0.5; 3], [0.0; 3]))
    }

    /// ROI: `i < 2` 的 120 个体素中前 120 个; 参考区: `i == 5` 平面中前 90 个.
    fn masks() -> (Mask, Mask) {
        let roi = (0..2)
            .flat_map(|i| (0..10).flat_map(move |j| (0..10).map(move |k| (i, j, k))))
            .take(120);
        let reference = (0..10).flat_map(|j| (0..10).map(move |k| (5, j, k))).take(90);
        (
            Mask::from_positions(grid(), roi),
            Mask::from_positions(grid(), reference),
        )
    }

    /// ROI 内取 `roi_value`; 参考区交替取 8 与 12 (均值 10, 标准差 2).
    fn volume(roi: &Mask, reference: &Mask, roi_value: f32) -> Volume {
        let mut data = Array3::from_elem(grid().shape(), 100.0f32);
        for p in roi.positions() {
            data[p] = roi_value;
        }
        for (n, p) in reference.positions().into_iter().enumerate() {
            data[p] = if n % 2 == 0 { 8.0 } else { 12.0 };
        }
        Volume::new(grid(), data).unwrap()
    }

    #[test]
    fn test_no_contrast() {
        let (roi, reference) = masks();
        assert_eq!((roi.count(), reference.count()), (120, 90));
        let s = compute_cnr(&volume(&roi, &reference, 10.0), &roi, &reference).unwrap();
        assert_eq!(s.mean_ref, 10.0);
        assert_eq!(s.std_ref, 2.0);
        assert_eq!(s.cnr, 0.0);
        assert_eq!(s.cr, 0.0);
    }

    #[test]
    fn test_positive_contrast() {
        let (roi, reference) = masks();
        let v = volume(&roi, &reference, 14.0);
        let s = compute_cnr(&v, &roi, &reference).unwrap();
        assert_eq!(s.mean_roi, 14.0);
        assert_eq!(s.cnr, 2.0);
        assert!((s.cr - 0.4).abs() < 1e-12);
        assert_eq!((s.roi_voxels, s.ref_voxels), (120, 90));

        // 重复计算结果完全一致.
        assert_eq!(compute_cnr(&v, &roi, &reference).unwrap(), s);
    }

    #[test]
    fn test_overlap_rejected() {
        let (roi, reference) = masks();
        let v = volume(&roi, &reference, 14.0);
        let mut positions = reference.positions();
        positions.push((0, 0, 0));
        let overlapping = Mask::from_positions(grid(), positions);

        let e = compute_cnr(&v, &roi, &overlapping).unwrap_err();
        assert!(matches!(e, ExtractError::MaskOverlap { overlap: 1, tolerance: 0 }));

        let s = compute_cnr_with_tolerance(&v, &roi, &overlapping, 1).unwrap();
        assert_eq!(s.ref_voxels, 90);
    }

    #[test]
    fn test_empty_and_degenerate() {
        let (roi, reference) = masks();
        let v = volume(&roi, &reference, 14.0);
        let e = compute_cnr(&v, &Mask::empty(grid()), &reference).unwrap_err();
        assert!(matches!(e, ExtractError::EmptyRoi("ROI")));

        // 参考区强度全部相同.
        let flat = v.with_data(Array3::from_elem(grid().shape(), 3.0)).unwrap();
        let e = compute_cnr(&flat, &roi, &reference).unwrap_err();
        assert!(matches!(e, ExtractError::DegenerateReference { .. }));

        // 参考区均值为零, CR 无定义.
        let mut data = v.data().to_owned();
        for (n, p) in reference.positions().into_iter().enumerate() {
            data[p] = if n % 2 == 0 { -2.0 } else { 2.0 };
        }
        for p in roi.positions() {
            data[p] = 5.0;
        }
        let centred = v.with_data(data).unwrap();
        let e = compute_cnr(&centred, &roi, &reference).unwrap_err();
        assert!(matches!(
            e,
            ExtractError::DegenerateReference { mean, std } if mean == 0.0 && std == 2.0
        ));
    }

    #[test]
    fn test_grid_mismatch() {
        let (roi, reference) = masks();
        let other = Grid::new((10, 10, 10), Affine::axis_aligned([1.0; 3], [0.0; 3]));
        let v = Volume::new(other, Array3::zeros((10, 10, 10))).unwrap();
        let e = compute_cnr(&v, &roi, &reference).unwrap_err();
        assert!(matches!(e, ExtractError::GridMismatch { what: "ROI", .. }));
    }

    #[test]
    fn test_roi_stats() {
        let mut data = Array3::<f32>::zeros(grid().shape());
        let mut mask = Array3::<f32>::zeros(grid().shape());
        for (n, v) in [1.0, 5.0, 2.0, f32::NAN, 4.0].into_iter().enumerate() {
            data[(n, 0, 0)] = v;
            mask[(n, 0, 0)] = 0.8;
        }
        let data = Volume::new(grid(), data).unwrap();
        let mask = Volume::new(grid(), mask).unwrap();
        let s = extract_roi_stats(&data, &mask, 0.5).unwrap();
        assert_eq!(s.voxel_count, 4);
        assert_eq!(s.mean, 3.0);
        assert_eq!(s.median, 3.0);
        assert_eq!((s.min, s.max), (1.0, 5.0));

        let e = extract_roi_stats(&data, &mask, 0.9).unwrap_err();
        assert!(matches!(e, ExtractError::EmptyRoi(_)));
    }
}
