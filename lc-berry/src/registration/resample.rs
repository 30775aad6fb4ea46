//! 重采样与滤波基础设施: 体素插值、可分离卷积、多分辨率金字塔.

use ndarray::{Array3, ArrayView1, ArrayView3, ArrayViewMut1, Axis, Zip};

use crate::{Affine, Grid, Point3};

/// 位移场. 三个分量分别为物理坐标系 `x`, `y`, `z` 方向的位移 (mm).
pub(crate) type Field = [Array3<f32>; 3];

/// 全零位移场.
pub(crate) fn zero_field(shape: (usize, usize, usize)) -> Field {
    [
        Array3::zeros(shape),
        Array3::zeros(shape),
        Array3::zeros(shape),
    ]
}

/// 最近邻取值. 落在数据范围外时返回 `0`.
pub(crate) fn sample_nearest(data: &ArrayView3<f32>, [x, y, z]: Point3) -> f32 {
    let (nx, ny, nz) = data.dim();
    let round = |v: f64, n: usize| -> Option<usize> {
        let r = v.round();
        (r >= 0.0 && r <= (n - 1) as f64).then_some(r as usize)
    };
    match (round(x, nx), round(y, ny), round(z, nz)) {
        (Some(i), Some(j), Some(k)) => data[(i, j, k)],
        _ => 0.0,
    }
}

/// 三线性插值. 落在数据范围外时返回 `0`.
pub(crate) fn sample_linear(data: &ArrayView3<f32>, [x, y, z]: Point3) -> f32 {
    const EPS: f64 = 1e-6;
    let (nx, ny, nz) = data.dim();

    // 返回 (下标, 下一下标, 权重)
    let split = |v: f64, n: usize| -> Option<(usize, usize, f64)> {
        if !(v >= -EPS && v <= (n - 1) as f64 + EPS) {
            return None;
        }
        let v = v.clamp(0.0, (n - 1) as f64);
        let i0 = v.floor() as usize;
        let i1 = (i0 + 1).min(n - 1);
        Some((i0, i1, v - i0 as f64))
    };
    let (Some((i0, i1, tx)), Some((j0, j1, ty)), Some((k0, k1, tz))) =
        (split(x, nx), split(y, ny), split(z, nz))
    else {
        return 0.0;
    };

    let lerp = |a: f32, b: f32, t: f64| a as f64 * (1.0 - t) + b as f64 * t;
    let c00 = lerp(data[(i0, j0, k0)], data[(i1, j0, k0)], tx);
    let c10 = lerp(data[(i0, j1, k0)], data[(i1, j1, k0)], tx);
    let c01 = lerp(data[(i0, j0, k1)], data[(i1, j0, k1)], tx);
    let c11 = lerp(data[(i0, j1, k1)], data[(i1, j1, k1)], tx);
    let c0 = c00 * (1.0 - ty) + c10 * ty;
    let c1 = c01 * (1.0 - ty) + c11 * ty;
    (c0 * (1.0 - tz) + c1 * tz) as f32
}

/// 一维卷积, 边界处按落在范围内的权重重新归一化.
fn convolve_lane(src: ArrayView1<f32>, mut dst: ArrayViewMut1<f32>, kernel: &[f64]) {
    let n = src.len() as isize;
    let r = (kernel.len() / 2) as isize;
    for i in 0..n {
        let mut acc = 0.0;
        let mut wsum = 0.0;
        for (t, w) in kernel.iter().enumerate() {
            let s = i + t as isize - r;
            if (0..n).contains(&s) {
                acc += w * src[s as usize] as f64;
                wsum += w;
            }
        }
        dst[i as usize] = if wsum > 0.0 { (acc / wsum) as f32 } else { 0.0 };
    }
}

/// 沿三个轴依次做可分离卷积.
fn convolve_separable(data: &Array3<f32>, kernel: &[f64]) -> Array3<f32> {
    let mut cur = data.clone();
    let mut next = Array3::zeros(data.dim());
    for axis in 0..3 {
        if cur.len_of(Axis(axis)) < 2 {
            continue;
        }
        Zip::from(next.lanes_mut(Axis(axis)))
            .and(cur.lanes(Axis(axis)))
            .for_each(|dst, src| convolve_lane(src, dst, kernel));
        std::mem::swap(&mut cur, &mut next);
    }
    cur
}

/// 高斯平滑, `sigma` 以体素为单位. `sigma` 不为正时原样返回.
pub(crate) fn gaussian_smooth(data: &Array3<f32>, sigma: f64) -> Array3<f32> {
    if !(sigma > 0.0) {
        return data.clone();
    }
    let r = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f64> = (-r..=r)
        .map(|t| (-(t * t) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    convolve_separable(data, &kernel)
}

/// 以 `(2r+1)^3` 立方体为窗口求局部均值.
pub(crate) fn box_mean(data: &Array3<f32>, radius: usize) -> Array3<f32> {
    if radius == 0 {
        return data.clone();
    }
    let kernel = vec![1.0; 2 * radius + 1];
    convolve_separable(data, &kernel)
}

/// 对位移场的每个分量做高斯平滑.
pub(crate) fn smooth_field(field: &Field, sigma: f64) -> Field {
    [
        gaussian_smooth(&field[0], sigma),
        gaussian_smooth(&field[1], sigma),
        gaussian_smooth(&field[2], sigma),
    ]
}

/// 中心差分梯度 (体素索引单位). 边界处退化为单侧差分.
pub(crate) fn index_gradient(data: &Array3<f32>) -> Field {
    let shape = data.dim();
    let mut grad = zero_field(shape);
    for (axis, g) in grad.iter_mut().enumerate() {
        let n = shape_along(shape, axis);
        if n < 2 {
            continue;
        }
        Zip::from(g.lanes_mut(Axis(axis)))
            .and(data.lanes(Axis(axis)))
            .for_each(|mut dst, src| {
                for i in 0..n {
                    let lo = i.saturating_sub(1);
                    let hi = (i + 1).min(n - 1);
                    dst[i] = (src[hi] - src[lo]) / (hi - lo) as f32;
                }
            });
    }
    grad
}

#[inline]
fn shape_along((a, b, c): (usize, usize, usize), axis: usize) -> usize {
    [a, b, c][axis]
}

/// 金字塔中某层的缩小倍数对应的仿射: 该层体素 `q` 对应原网格体素 `s*q + (s-1)/2`.
pub(crate) fn shrink_affine(affine: &Affine, shrink: usize) -> Affine {
    let s = shrink as f64;
    let o = (s - 1.0) / 2.0;
    let scale = Affine::from_row_slice(&[
        s, 0.0, 0.0, o, //
        0.0, s, 0.0, o, //
        0.0, 0.0, s, o, //
        0.0, 0.0, 0.0, 1.0,
    ]);
    affine.then_after(&scale)
}

/// 块平均降采样. 每维至少保留一个体素, 末尾不完整的块按实际体素数平均.
pub(crate) fn downsample(data: &ArrayView3<f32>, grid: &Grid, shrink: usize) -> (Array3<f32>, Grid) {
    if shrink <= 1 {
        return (data.to_owned(), *grid);
    }
    let (nx, ny, nz) = data.dim();
    let dim = |n: usize| (n / shrink).max(1);
    let shape = (dim(nx), dim(ny), dim(nz));

    let out = Array3::from_shape_fn(shape, |(i, j, k)| {
        let range = |q: usize, n: usize| (q * shrink).min(n - 1)..((q + 1) * shrink).min(n);
        let block = data.slice(ndarray::s![range(i, nx), range(j, ny), range(k, nz)]);
        let len = block.len().max(1);
        block.sum() / len as f32
    });
    (out, Grid::new(shape, shrink_affine(grid.affine(), shrink)))
}

/// 将定义在 `from` 网格上的位移场插值到 `to` 网格. 两者须描述同一物理区域.
/// 超出 `from` 范围的位置, 取最近边界体素的值.
pub(crate) fn resample_field(field: &Field, from: &Grid, to: &Grid) -> Field {
    let Some(from_inv) = from.affine().inverse() else {
        return zero_field(to.shape());
    };
    let map = from_inv.then_after(to.affine());
    let (fx, fy, fz) = from.shape();
    let clamp = |[x, y, z]: Point3| {
        [
            x.clamp(0.0, (fx - 1) as f64),
            y.clamp(0.0, (fy - 1) as f64),
            z.clamp(0.0, (fz - 1) as f64),
        ]
    };
    let views = [field[0].view(), field[1].view(), field[2].view()];
    let component = |c: usize| {
        Array3::from_shape_fn(to.shape(), |(i, j, k)| {
            let p = clamp(map.apply([i as f64, j as f64, k as f64]));
            sample_linear(&views[c], p)
        })
    };
    [component(0), component(1), component(2)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GridAttr;
    use ndarray::Array3;

    #[test]
    fn test_linear_and_nearest() {
        let data = Array3::from_shape_fn((3, 3, 3), |(i, _, _)| i as f32);
        let v = data.view();
        assert!((sample_linear(&v, [0.5, 1.0, 1.0]) - 0.5).abs() < 1e-6);
        assert!((sample_linear(&v, [2.0, 2.0, 2.0]) - 2.0).abs() < 1e-6);
        assert_eq!(sample_linear(&v, [-0.6, 1.0, 1.0]), 0.0);
        assert_eq!(sample_nearest(&v, [1.4, 0.0, 0.0]), 1.0);
        assert_eq!(sample_nearest(&v, [2.6, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_gaussian_preserves_constant() {
        let data = Array3::from_elem((5, 6, 7), 3.0f32);
        let out = gaussian_smooth(&data, 1.5);
        assert!(out.iter().all(|v| (v - 3.0).abs() < 1e-5));

        let box_out = box_mean(&data, 2);
        assert!(box_out.iter().all(|v| (v - 3.0).abs() < 1e-5));
    }

    #[test]
    fn test_gradient_of_ramp() {
        let data = Array3::from_shape_fn((4, 4, 4), |(_, j, _)| 2.0 * j as f32);
        let g = index_gradient(&data);
        assert!(g[0].iter().all(|v| v.abs() < 1e-6));
        assert!(g[1].iter().all(|v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_downsample_keeps_physical_centre() {
        let grid = Grid::new((8, 8, 8), Affine::axis_aligned([1.0; 3], [0.0; 3]));
        let data = Array3::from_shape_fn((8, 8, 8), |(i, _, _)| i as f32);
        let (small, g2) = downsample(&data.view(), &grid, 2);
        assert_eq!(small.dim(), (4, 4, 4));
        // 块 {0, 1} 平均为 0.5, 中心位于物理坐标 0.5.
        assert!((small[(0, 0, 0)] - 0.5).abs() < 1e-6);
        assert_eq!(g2.to_physical((0, 0, 0)), [0.5, 0.5, 0.5]);
        assert_eq!(g2.voxel_sizes(), [2.0, 2.0, 2.0]);
    }
}
