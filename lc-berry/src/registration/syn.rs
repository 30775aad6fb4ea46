//! 多分辨率对称力 demons (SyN 风格的贪心微分同胚配准).
//!
//! 每层迭代: 按当前位移场采样运动图像 → 计算度量导数 → 以对称梯度
//! `(∇F + ∇M∘φ) / 2` 作为力的方向 → 归一化到 `gradient_step` 个体素的最大步长
//! → 以 `flow_sigma` 平滑更新量 → 累加到位移场 (可选以 `total_sigma` 再平滑).
//! 若候选场使能量上升, 则拒绝该步并将步长减半.

use ndarray::Array3;

use super::metric::{evaluate, Evaluation};
use super::resample::{
    downsample, index_gradient, resample_field, sample_linear, smooth_field, zero_field, Field,
};
use super::{RegistrationError, RegistrationParams};
use crate::{Affine, Grid, GridAttr};

/// 步长缩减到初始的这一比例以下时, 结束当前层.
const MIN_STEP_SCALE: f64 = 1.0 / 64.0;

/// 某层 (或原分辨率) 上的图像.
pub(crate) struct Image {
    pub data: Array3<f32>,
    pub grid: Grid,
}

impl Image {
    fn shrink(&self, factor: usize) -> Image {
        let (data, grid) = downsample(&self.data.view(), &self.grid, factor);
        Image { data, grid }
    }
}

/// 按位移场采样运动图像, 结果位于 `fixed_grid` 上.
///
/// `to_moving` 将 (位移后的) 固定物理坐标映射到运动图像的体素坐标.
fn warp(moving: &Image, fixed_grid: &Grid, to_moving: &Affine, field: &Field) -> Array3<f32> {
    let view = moving.data.view();
    Array3::from_shape_fn(fixed_grid.shape(), |p| {
        let [x, y, z] = fixed_grid.to_physical(p);
        let x = [
            x + field[0][p] as f64,
            y + field[1][p] as f64,
            z + field[2][p] as f64,
        ];
        sample_linear(&view, to_moving.apply(x))
    })
}

/// 一层迭代的状态.
struct LevelState {
    field: Field,
    warped: Array3<f32>,
    eval: Evaluation,
}

/// 计算对称梯度力, 转为物理坐标 (mm⁻¹).
fn symmetric_force(grid: &Grid, fixed_grad: &Field, state: &LevelState) -> Field {
    let warped_grad = index_gradient(&state.warped);
    // 物理梯度 = L^{-T} · 索引梯度
    let inv_t = grid
        .affine()
        .linear()
        .try_inverse()
        .map(|m| m.transpose())
        .unwrap_or_else(nalgebra::Matrix3::identity);

    let mut force = zero_field(grid.shape());
    for (p, &c) in state.eval.coefficient.indexed_iter() {
        if c == 0.0 {
            continue;
        }
        let g = nalgebra::Vector3::new(
            0.5 * (fixed_grad[0][p] + warped_grad[0][p]) as f64,
            0.5 * (fixed_grad[1][p] + warped_grad[1][p]) as f64,
            0.5 * (fixed_grad[2][p] + warped_grad[2][p]) as f64,
        );
        let g = inv_t * g;
        for a in 0..3 {
            force[a][p] = (c as f64 * g[a]) as f32;
        }
    }
    force
}

/// 逐体素力的最大模长.
fn max_norm(field: &Field) -> f64 {
    let mut best = 0.0f64;
    ndarray::Zip::from(&field[0])
        .and(&field[1])
        .and(&field[2])
        .for_each(|a, b, c| {
            let n = ((a * a + b * b + c * c) as f64).sqrt();
            if n > best {
                best = n;
            }
        });
    best
}

/// 在 `init` 之上估计位移场 (定义在 `fixed.grid` 上, 单位 mm).
///
/// 返回位移场以及 (初始能量, 最终能量), 两者均在原分辨率上计算.
/// 只接受不增大能量的步长, 最细层上场不如零场时退回零场, 因此最终能量不大于初始能量.
/// 能量变为非有限值时返回 [`RegistrationError::NotConverged`].
pub(crate) fn estimate_field(
    fixed: &Image,
    moving: &Image,
    init: &Affine,
    params: &RegistrationParams,
) -> Result<(Field, f64, f64), RegistrationError> {
    let levels = params.iterations.len();
    let mut prev: Option<(Field, Grid)> = None;
    let mut energies = (f64::NAN, f64::NAN);

    for (level, &iterations) in params.iterations.iter().enumerate() {
        let shrink = 1usize << (levels - 1 - level);
        let f = fixed.shrink(shrink);
        let m = moving.shrink(shrink);
        let to_moving = m
            .grid
            .affine()
            .inverse()
            .ok_or_else(|| RegistrationError::DegenerateGeometry("moving affine is singular".into()))?
            .then_after(init);

        let eval_field = |field: Field| -> Result<LevelState, RegistrationError> {
            let warped = warp(&m, &f.grid, &to_moving, &field);
            let eval = evaluate(params.metric, params.sampling as usize, &f.data, &warped);
            if !eval.energy.is_finite() {
                return Err(RegistrationError::NotConverged(format!(
                    "metric became non-finite at level {level}"
                )));
            }
            Ok(LevelState {
                field,
                warped,
                eval,
            })
        };

        let zero = eval_field(zero_field(f.grid.shape()))?;
        let is_finest = level + 1 == levels;
        if is_finest {
            energies.0 = zero.eval.energy;
        }
        let mut state = match prev.take() {
            Some((field, grid)) => {
                let up = eval_field(resample_field(&field, &grid, &f.grid))?;
                // 最细层上, 粗层结果若不如零位移场, 则丢弃.
                if is_finest && up.eval.energy > zero.eval.energy {
                    zero
                } else {
                    up
                }
            }
            None => zero,
        };

        let spacing = f.grid.voxel_sizes().into_iter().fold(f64::INFINITY, f64::min);
        let fixed_grad = index_gradient(&f.data);
        let mut step_scale = 1.0;
        let mut history = vec![state.eval.energy];

        for _ in 0..iterations {
            let force = symmetric_force(&f.grid, &fixed_grad, &state);
            let norm = max_norm(&force);
            if norm <= 1e-12 {
                break;
            }
            let factor = params.gradient_step * spacing * step_scale / norm;
            let update = smooth_field(&force.map(|c| c * factor as f32), params.flow_sigma);

            let mut candidate = [
                &state.field[0] + &update[0],
                &state.field[1] + &update[1],
                &state.field[2] + &update[2],
            ];
            if params.total_sigma > 0.0 {
                candidate = smooth_field(&candidate, params.total_sigma);
            }

            let next = eval_field(candidate)?;
            if next.eval.energy <= state.eval.energy {
                state = next;
                history.push(state.eval.energy);
            } else {
                step_scale *= 0.5;
                if step_scale < MIN_STEP_SCALE {
                    break;
                }
                continue;
            }

            let window = params.convergence_window as usize;
            if window > 0 && history.len() > window {
                let old = history[history.len() - 1 - window];
                let change = (old - state.eval.energy).abs() / old.abs().max(1e-12);
                if change < params.convergence_threshold {
                    break;
                }
            }
        }
        log::debug!(
            "level {level} (shrink {shrink}): {} accepted steps, energy {:.6}",
            history.len() - 1,
            state.eval.energy
        );

        if is_finest {
            energies.1 = state.eval.energy;
        }
        prev = Some((state.field, f.grid));
    }

    let Some((field, _)) = prev else {
        return Err(RegistrationError::UnknownParameter(
            "empty iteration schedule".to_owned(),
        ));
    };
    Ok((field, energies.0, energies.1))
}
