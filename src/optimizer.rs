//! General-purpose global optimizer (C1) driving a [`ParameterModel`]
//! against an arbitrary scalar cost function.

use crate::param::ParameterModel;

/// Distinct search strategies; every evaluator accepts any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoMethod {
    GlobalNelderMead,
    CyclicalCrossHairScan,
    GlobalCrossHairScan,
    WeakestDimensionCrossHairScan,
    WeakestGroupCrossHairScan,
    GlobalBoxScan,
}

/// Residual statistics optionally filled in by `get_solution`.
#[derive(Debug, Clone, Default)]
pub struct EasyStats {
    samples: Vec<f64>,
}

impl EasyStats {
    pub fn push(&mut self, v: f64) {
        self.samples.push(v);
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    pub fn sd(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let m = self.mean();
        (self.samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / self.samples.len() as f64)
            .sqrt()
    }

    /// Coefficient of variation, as percent.
    pub fn cov(&self) -> f64 {
        let m = self.mean();
        if m == 0.0 {
            0.0
        } else {
            (self.sd() / m).abs() * 100.0
        }
    }
}

/// Small capability set implemented by every concrete cost evaluator
/// (volume or point domain): `evaluate` scores the current parameter
/// assignment, lower is better.
pub trait Evaluable {
    fn model(&self) -> &ParameterModel;
    fn model_mut(&mut self) -> &mut ParameterModel;
    fn evaluate(&mut self, stats: Option<&mut EasyStats>) -> f64;
}

const MAX_ITERATIONS: usize = 500;

/// Drives `eval`'s `ParameterModel` to a local minimum of `eval.evaluate()`
/// using `method`, to within `precision` (relative to each dimension's
/// half-range). Bounds are respected (clipped) for every scan method;
/// Nelder-Mead may leave the simplex outside the box.
pub struct GlobalOptimize;

impl GlobalOptimize {
    pub fn get_solution<E: Evaluable>(
        eval: &mut E,
        method: GoMethod,
        precision: f64,
        stats: Option<&mut EasyStats>,
    ) -> f64 {
        match method {
            GoMethod::GlobalNelderMead => Self::nelder_mead(eval, precision),
            GoMethod::CyclicalCrossHairScan => Self::cyclical_cross_hair(eval, precision, true),
            GoMethod::GlobalCrossHairScan => Self::cyclical_cross_hair(eval, precision, false),
            GoMethod::WeakestDimensionCrossHairScan => Self::weakest_dimension(eval, precision),
            GoMethod::WeakestGroupCrossHairScan => Self::weakest_group(eval, precision),
            GoMethod::GlobalBoxScan => Self::box_scan(eval, precision),
        };
        eval.evaluate(stats)
    }

    fn dims(eval: &impl Evaluable) -> Vec<crate::param::ParameterId> {
        eval.model().ids().collect()
    }

    /// 1-D bracketed line search over dimension `id`, clipped to its bounds.
    fn line_search<E: Evaluable>(eval: &mut E, id: crate::param::ParameterId, precision: f64) {
        let (min, max) = match eval.model().dimension(id) {
            Some(d) => (d.min, d.max),
            None => return,
        };
        let mut lo = min;
        let mut hi = max;
        let mut best = eval.model().get_value(id).clamp(min, max);

        for _ in 0..40 {
            let span = hi - lo;
            if span.abs() < precision * (max - min).abs().max(1e-12) {
                break;
            }
            let a = lo + span / 3.0;
            let b = hi - span / 3.0;

            eval.model_mut().set_value(id, a);
            let fa = eval.evaluate(None);
            eval.model_mut().set_value(id, b);
            let fb = eval.evaluate(None);

            if fa < fb {
                hi = b;
                best = a;
            } else {
                lo = a;
                best = b;
            }
        }
        eval.model_mut().set_value(id, best.clamp(min, max));
    }

    fn cyclical_cross_hair<E: Evaluable>(eval: &mut E, precision: f64, by_group: bool) {
        let groups: Vec<Vec<crate::param::ParameterId>> = if by_group {
            eval.model().groups().to_vec()
        } else {
            vec![Self::dims(eval)]
        };

        let mut prev_cost = eval.evaluate(None);
        for _ in 0..MAX_ITERATIONS {
            for group in &groups {
                for &id in group {
                    Self::line_search(eval, id, precision);
                }
            }
            let cost = eval.evaluate(None);
            if (prev_cost - cost).abs() <= precision * prev_cost.abs().max(1e-12) {
                break;
            }
            prev_cost = cost;
        }
    }

    fn weakest_dimension<E: Evaluable>(eval: &mut E, precision: f64) {
        let dims = Self::dims(eval);
        let mut prev_cost = eval.evaluate(None);
        for _ in 0..MAX_ITERATIONS {
            let mut worst = None;
            let mut worst_grad = -1f64;
            let base = eval.evaluate(None);
            for &id in &dims {
                let (min, max) = match eval.model().dimension(id) {
                    Some(d) => (d.min, d.max),
                    None => continue,
                };
                let v = eval.model().get_value(id);
                let step = (max - min).abs() * 1e-3;
                eval.model_mut().set_value(id, (v + step).clamp(min, max));
                let bumped = eval.evaluate(None);
                eval.model_mut().set_value(id, v);
                let grad = (bumped - base).abs();
                if grad > worst_grad {
                    worst_grad = grad;
                    worst = Some(id);
                }
            }
            if let Some(id) = worst {
                Self::line_search(eval, id, precision);
            }
            let cost = eval.evaluate(None);
            if (prev_cost - cost).abs() <= precision * prev_cost.abs().max(1e-12) {
                break;
            }
            prev_cost = cost;
        }
    }

    fn weakest_group<E: Evaluable>(eval: &mut E, precision: f64) {
        let groups = eval.model().groups().to_vec();
        let mut prev_cost = eval.evaluate(None);
        for _ in 0..MAX_ITERATIONS {
            let base = eval.evaluate(None);
            let mut worst_group = None;
            let mut worst_grad = -1f64;
            for (gi, group) in groups.iter().enumerate() {
                let mut grad = 0f64;
                for &id in group {
                    let (min, max) = match eval.model().dimension(id) {
                        Some(d) => (d.min, d.max),
                        None => continue,
                    };
                    let v = eval.model().get_value(id);
                    let step = (max - min).abs() * 1e-3;
                    eval.model_mut().set_value(id, (v + step).clamp(min, max));
                    let bumped = eval.evaluate(None);
                    eval.model_mut().set_value(id, v);
                    grad += (bumped - base).abs();
                }
                if grad > worst_grad {
                    worst_grad = grad;
                    worst_group = Some(gi);
                }
            }
            if let Some(gi) = worst_group {
                for &id in &groups[gi] {
                    Self::line_search(eval, id, precision);
                }
            }
            let cost = eval.evaluate(None);
            if (prev_cost - cost).abs() <= precision * prev_cost.abs().max(1e-12) {
                break;
            }
            prev_cost = cost;
        }
    }

    fn box_scan<E: Evaluable>(eval: &mut E, precision: f64) {
        let dims = Self::dims(eval);
        let mut bounds: Vec<(f64, f64)> = dims
            .iter()
            .map(|&id| {
                let d = eval.model().dimension(id).unwrap();
                (d.min, d.max)
            })
            .collect();

        const SAMPLES_PER_DIM: usize = 5;
        for _round in 0..30 {
            let mut best_cost = f64::INFINITY;
            let mut best_values = vec![0.0; dims.len()];

            let total: usize = SAMPLES_PER_DIM.pow(dims.len().min(4) as u32).max(1);
            for sample in 0..total.min(512) {
                let mut idx = sample;
                for (k, &id) in dims.iter().enumerate() {
                    let s = idx % SAMPLES_PER_DIM;
                    idx /= SAMPLES_PER_DIM;
                    let (lo, hi) = bounds[k];
                    let frac = s as f64 / (SAMPLES_PER_DIM - 1) as f64;
                    let v = lo + frac * (hi - lo);
                    eval.model_mut().set_value(id, v);
                }
                let cost = eval.evaluate(None);
                if cost < best_cost {
                    best_cost = cost;
                    for (k, &id) in dims.iter().enumerate() {
                        best_values[k] = eval.model().get_value(id);
                    }
                }
            }
            for (k, &id) in dims.iter().enumerate() {
                eval.model_mut().set_value(id, best_values[k]);
                let (lo, hi) = bounds[k];
                let span = (hi - lo) * 0.5;
                bounds[k] = ((best_values[k] - span / 2.0).max(lo), (best_values[k] + span / 2.0).min(hi));
            }
            let span_total: f64 = bounds.iter().map(|(lo, hi)| (hi - lo).abs()).sum();
            if span_total < precision * dims.len().max(1) as f64 {
                break;
            }
        }
    }

    /// Downhill simplex over all active dimensions jointly. Bounds are
    /// soft: the simplex may leave the box; final values are not clipped.
    fn nelder_mead<E: Evaluable>(eval: &mut E, precision: f64) {
        let dims = Self::dims(eval);
        let n = dims.len();
        if n == 0 {
            return;
        }

        let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
        let base: Vec<f64> = dims.iter().map(|&id| eval.model().get_value(id)).collect();
        simplex.push(base.clone());
        for i in 0..n {
            let mut v = base.clone();
            let d = eval.model().dimension(dims[i]).unwrap();
            let step = (d.max - d.min).abs() * 0.1;
            v[i] += if step == 0.0 { 0.1 } else { step };
            simplex.push(v);
        }

        let eval_point = |eval: &mut E, pt: &[f64]| -> f64 {
            for (i, &id) in dims.iter().enumerate() {
                eval.model_mut().set_value(id, pt[i]);
            }
            eval.evaluate(None)
        };

        let mut costs: Vec<f64> = simplex.iter().map(|pt| eval_point(eval, pt)).collect();

        for _ in 0..MAX_ITERATIONS {
            let mut order: Vec<usize> = (0..=n).collect();
            order.sort_by(|&a, &b| costs[a].partial_cmp(&costs[b]).unwrap());
            let best = order[0];
            let worst = order[n];
            let second_worst = order[n - 1];

            if (costs[worst] - costs[best]).abs() <= precision * costs[best].abs().max(1e-12) {
                break;
            }

            let centroid: Vec<f64> = (0..n)
                .map(|k| {
                    order[..n]
                        .iter()
                        .filter(|&&i| i != worst)
                        .map(|&i| simplex[i][k])
                        .sum::<f64>()
                        / (n as f64 - 1.0).max(1.0)
                })
                .collect();

            let reflect: Vec<f64> = (0..n)
                .map(|k| centroid[k] + 1.0 * (centroid[k] - simplex[worst][k]))
                .collect();
            let reflect_cost = eval_point(eval, &reflect);

            if reflect_cost < costs[best] {
                let expand: Vec<f64> = (0..n)
                    .map(|k| centroid[k] + 2.0 * (reflect[k] - centroid[k]))
                    .collect();
                let expand_cost = eval_point(eval, &expand);
                if expand_cost < reflect_cost {
                    simplex[worst] = expand;
                    costs[worst] = expand_cost;
                } else {
                    simplex[worst] = reflect;
                    costs[worst] = reflect_cost;
                }
            } else if reflect_cost < costs[second_worst] {
                simplex[worst] = reflect;
                costs[worst] = reflect_cost;
            } else {
                let contract: Vec<f64> = (0..n)
                    .map(|k| centroid[k] + 0.5 * (simplex[worst][k] - centroid[k]))
                    .collect();
                let contract_cost = eval_point(eval, &contract);
                if contract_cost < costs[worst] {
                    simplex[worst] = contract;
                    costs[worst] = contract_cost;
                } else {
                    for &i in &order[1..=n] {
                        for k in 0..n {
                            simplex[i][k] = simplex[best][k] + 0.5 * (simplex[i][k] - simplex[best][k]);
                        }
                        costs[i] = eval_point(eval, &simplex[i]);
                    }
                }
            }
        }

        let best_idx = (0..=n)
            .min_by(|&a, &b| costs[a].partial_cmp(&costs[b]).unwrap())
            .unwrap();
        eval_point(eval, &simplex[best_idx].clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{ParameterId, ParameterModel};

    struct Bowl {
        model: ParameterModel,
        target: (f64, f64),
    }

    impl Evaluable for Bowl {
        fn model(&self) -> &ParameterModel {
            &self.model
        }
        fn model_mut(&mut self) -> &mut ParameterModel {
            &mut self.model
        }
        fn evaluate(&mut self, _stats: Option<&mut EasyStats>) -> f64 {
            let x = self.model.get_value(ParameterId::TranslationX);
            let y = self.model.get_value(ParameterId::TranslationY);
            (x - self.target.0).powi(2) + (y - self.target.1).powi(2)
        }
    }

    fn bowl(target: (f64, f64)) -> Bowl {
        let mut model = ParameterModel::new();
        let g = model.add_group();
        model.add_dim(g, ParameterId::TranslationX, -20.0, 20.0);
        model.add_dim(g, ParameterId::TranslationY, -20.0, 20.0);
        model.set_value(ParameterId::TranslationX, 0.0);
        model.set_value(ParameterId::TranslationY, 0.0);
        Bowl { model, target }
    }

    #[test]
    fn nelder_mead_finds_minimum() {
        let mut b = bowl((5.0, -3.0));
        let cost = GlobalOptimize::get_solution(&mut b, GoMethod::GlobalNelderMead, 1e-6, None);
        assert!(cost < 1e-3);
        assert!((b.model.get_value(ParameterId::TranslationX) - 5.0).abs() < 0.05);
    }

    #[test]
    fn cyclical_cross_hair_finds_minimum() {
        let mut b = bowl((2.0, 7.0));
        let cost = GlobalOptimize::get_solution(
            &mut b,
            GoMethod::CyclicalCrossHairScan,
            1e-6,
            None,
        );
        assert!(cost < 1e-2);
    }
}
