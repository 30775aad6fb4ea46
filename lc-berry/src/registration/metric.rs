//! 相似性度量及其对运动图像的导数.

use ndarray::Array3;

use super::resample::box_mean;
use super::Metric;

/// 局部方差低于该值的窗口不参与互相关计算.
const VARIANCE_EPS: f32 = 1e-6;

/// 度量求值结果.
pub(crate) struct Evaluation {
    /// 能量, 越小越好. 互相关取负值.
    pub energy: f64,

    /// 逐体素力系数. 实际驱动力为该系数乘以图像梯度.
    pub coefficient: Array3<f32>,
}

/// 计算 `fixed` 与 `warped` 之间的度量值和逐体素力系数.
pub(crate) fn evaluate(metric: Metric, radius: usize, fixed: &Array3<f32>, warped: &Array3<f32>) -> Evaluation {
    match metric {
        Metric::MeanSquares => mean_squares(fixed, warped),
        Metric::CC => cross_correlation(radius.max(1), fixed, warped),
    }
}

fn mean_squares(fixed: &Array3<f32>, warped: &Array3<f32>) -> Evaluation {
    let coefficient = fixed - warped;
    let n = coefficient.len().max(1) as f64;
    let energy = coefficient.iter().map(|d| (*d as f64).powi(2)).sum::<f64>() / n;
    Evaluation {
        energy,
        coefficient,
    }
}

fn cross_correlation(radius: usize, fixed: &Array3<f32>, warped: &Array3<f32>) -> Evaluation {
    let f_mean = box_mean(fixed, radius);
    let m_mean = box_mean(warped, radius);
    let ff = box_mean(&(fixed * fixed), radius);
    let mm = box_mean(&(warped * warped), radius);
    let fm = box_mean(&(fixed * warped), radius);

    let mut coefficient = Array3::<f32>::zeros(fixed.dim());
    let mut cc_sum = 0.0;
    let mut valid = 0usize;

    // 参与计算的数组超过 `Zip` 的上限, 这里逐下标计算.
    for (idx, c) in coefficient.indexed_iter_mut() {
        let (fbar, mbar) = (f_mean[idx], m_mean[idx]);
        let vf = ff[idx] - fbar * fbar;
        let vm = mm[idx] - mbar * mbar;
        if !(vf > VARIANCE_EPS && vm > VARIANCE_EPS) {
            continue;
        }
        let cov = fm[idx] - fbar * mbar;
        let fh = fixed[idx] - fbar;
        let mh = warped[idx] - mbar;
        cc_sum += (cov * cov / (vf * vm)) as f64;
        valid += 1;
        *c = 2.0 * cov / (vf * vm) * (fh - cov / vm * mh);
    }

    let energy = if valid == 0 {
        0.0
    } else {
        -cc_sum / valid as f64
    };
    Evaluation {
        energy,
        coefficient,
    }
}
