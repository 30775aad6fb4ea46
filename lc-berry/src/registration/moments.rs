//! 基于强度矩的初始对齐.

use ndarray::ArrayView3;

use super::{RegistrationError, RegistrationKind};
use crate::{Affine, Grid, GridAttr, Point3};

/// 前景强度矩 (物理坐标系): 质心、逐轴标准差以及前景包围盒.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Moments {
    pub centroid: Point3,
    pub spread: [f64; 3],
}

/// 计算 `data` 在 `grid` 上的强度加权矩. 非有限值与非正值不计入前景.
///
/// 前景为空, 或前景包围盒在任一轴上退化为一个平面时, 返回
/// [`RegistrationError::DegenerateGeometry`].
pub(crate) fn moments(data: &ArrayView3<f32>, grid: &Grid, role: &str) -> Result<Moments, RegistrationError> {
    let degenerate = |reason: String| RegistrationError::DegenerateGeometry(format!("{role} {reason}"));

    let mut wsum = 0.0;
    let mut s1 = [0.0; 3];
    let mut s2 = [0.0; 3];
    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];
    for ((i, j, k), &v) in data.indexed_iter() {
        if !(v.is_finite() && v > 0.0) {
            continue;
        }
        let w = v as f64;
        let x = grid.to_physical((i, j, k));
        for a in 0..3 {
            s1[a] += w * x[a];
            s2[a] += w * x[a] * x[a];
        }
        wsum += w;
        for (a, idx) in [i, j, k].into_iter().enumerate() {
            lo[a] = lo[a].min(idx);
            hi[a] = hi[a].max(idx);
        }
    }

    if wsum <= 0.0 {
        return Err(degenerate("volume has no positive finite voxel".to_owned()));
    }
    if (0..3).any(|a| hi[a] == lo[a]) {
        return Err(degenerate(format!(
            "foreground bounding box has zero extent: {lo:?}..={hi:?}"
        )));
    }

    let centroid = s1.map(|s| s / wsum);
    let mut spread = [0.0; 3];
    for a in 0..3 {
        spread[a] = (s2[a] / wsum - centroid[a] * centroid[a]).max(0.0).sqrt();
    }
    if spread.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
        return Err(degenerate(format!("foreground spread {spread:?} is degenerate")));
    }
    Ok(Moments { centroid, spread })
}

/// 校验网格本身: 非空形状, 可逆仿射.
pub(crate) fn check_grid(grid: &Grid, role: &str) -> Result<Affine, RegistrationError> {
    if grid.size() == 0 {
        return Err(RegistrationError::DegenerateGeometry(format!(
            "{role} grid {:?} is empty",
            grid.shape()
        )));
    }
    grid.affine().inverse().ok_or_else(|| {
        RegistrationError::DegenerateGeometry(format!("{role} affine is singular"))
    })
}

/// 由矩构造初始变换 (固定物理坐标 -> 运动物理坐标).
///
/// `Translation` 只对齐质心; `Affine` 与 `SyN` 还按逐轴标准差之比缩放.
pub(crate) fn initial_affine(fixed: &Moments, moving: &Moments, kind: RegistrationKind) -> Affine {
    let scale = match kind {
        RegistrationKind::Translation => [1.0; 3],
        RegistrationKind::Affine | RegistrationKind::SyN => {
            [0, 1, 2].map(|a| moving.spread[a] / fixed.spread[a])
        }
    };
    // y = c_m + D (x - c_f)
    let t = [0, 1, 2].map(|a| moving.centroid[a] - scale[a] * fixed.centroid[a]);
    Affine::from_row_slice(&[
        scale[0], 0.0, 0.0, t[0], //
        0.0, scale[1], 0.0, t[1], //
        0.0, 0.0, scale[2], t[2], //
        0.0, 0.0, 0.0, 1.0,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn grid(n: usize) -> Grid {
        Grid::new((n, n, n), Affine::axis_aligned([1.0; 3], [0.0; 3]))
    }

    #[test]
    fn test_centroid_of_box() {
        let mut data = Array3::<f32>::zeros((8, 8, 8));
        data.slice_mut(ndarray::s![2..5, 3..6, 1..4]).fill(1.0);
        let m = moments(&data.view(), &grid(8), "fixed").unwrap();
        assert_eq!(m.centroid, [3.0, 4.0, 2.0]);
        assert!(m.spread.iter().all(|s| (s - (2.0f64 / 3.0).sqrt()).abs() < 1e-9));
    }

    #[test]
    fn test_empty_and_flat_foreground() {
        let data = Array3::<f32>::zeros((4, 4, 4));
        assert!(matches!(
            moments(&data.view(), &grid(4), "moving"),
            Err(RegistrationError::DegenerateGeometry(_))
        ));

        let mut flat = Array3::<f32>::zeros((4, 4, 4));
        flat.slice_mut(ndarray::s![.., .., 2]).fill(1.0);
        assert!(matches!(
            moments(&flat.view(), &grid(4), "moving"),
            Err(RegistrationError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn test_translation_init() {
        let f = Moments {
            centroid: [1.0, 2.0, 3.0],
            spread: [1.0; 3],
        };
        let m = Moments {
            centroid: [4.0, 2.0, 0.0],
            spread: [2.0; 3],
        };
        let t = initial_affine(&f, &m, RegistrationKind::Translation);
        assert_eq!(t.apply([1.0, 2.0, 3.0]), [4.0, 2.0, 0.0]);

        let a = initial_affine(&f, &m, RegistrationKind::Affine);
        assert_eq!(a.apply([1.0, 2.0, 3.0]), [4.0, 2.0, 0.0]);
        assert_eq!(a.apply([2.0, 2.0, 3.0]), [6.0, 2.0, 0.0]);
    }
}
