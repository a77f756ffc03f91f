use nalgebra::{DMatrix, DVector};

const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e16;
/// Jacobian columns with a squared norm below this fraction of the largest one are frozen
const FROZEN_COLUMN: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    #[error("no convergence after {0} iterations")]
    MaxIterations(usize),
    #[error("model evaluation returned non finite values")]
    NonFinite,
}
type Result<T> = std::result::Result<T, SolverError>;

/// Box constraints
#[derive(Debug, Clone)]
pub struct Bounds {
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}
impl Bounds {
    pub fn new(lower: &[f64], upper: &[f64]) -> Self {
        Self {
            lower: DVector::from_column_slice(lower),
            upper: DVector::from_column_slice(upper),
        }
    }
    pub fn clamp(&self, p: &DVector<f64>) -> DVector<f64> {
        p.zip_zip_map(&self.lower, &self.upper, |x, lo, hi| x.max(lo).min(hi))
    }
}

/// Least squares minimum
#[derive(Debug, Clone)]
pub struct Solution {
    pub params: DVector<f64>,
    /// half the sum of squared residuals
    pub cost: f64,
    pub iterations: usize,
    /// parameters covariance estimate, `None` if `JᵀJ` is singular
    pub covariance: Option<DMatrix<f64>>,
}

/// Levenberg-Marquardt with box constraints
///
/// Steps are projected onto the box. The Jacobian is computed with central
/// differences, one-sided at the bounds. Parameters the model is not
/// sensitive to (finite-difference noise only) are held fixed during a step.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    /// relative cost reduction tolerance
    pub ftol: f64,
    /// relative step tolerance
    pub xtol: f64,
    /// projected gradient tolerance
    pub gtol: f64,
    /// initial damping
    pub lambda: f64,
}
impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-8,
            xtol: 1e-8,
            gtol: 1e-8,
            lambda: 1e-3,
        }
    }
}

fn is_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

impl LevenbergMarquardt {
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }
    fn jacobian<F>(
        &self,
        model: &F,
        p: &DVector<f64>,
        f0: &DVector<f64>,
        bounds: &Bounds,
    ) -> DMatrix<f64>
    where
        F: Fn(&DVector<f64>) -> DVector<f64>,
    {
        let mut jac = DMatrix::<f64>::zeros(f0.len(), p.len());
        let shifted = |j: usize, h: f64| {
            let mut q = p.clone();
            q[j] += h;
            model(&q)
        };
        for j in 0..p.len() {
            let scale = p[j].abs().max(1f64);
            let h = f64::EPSILON.cbrt() * scale;
            let up = p[j] + h <= bounds.upper[j];
            let down = p[j] - h >= bounds.lower[j];
            let column = if up && down {
                (shifted(j, h) - shifted(j, -h)) / (2f64 * h)
            } else {
                let h = f64::EPSILON.sqrt() * scale;
                if p[j] + h <= bounds.upper[j] {
                    (shifted(j, h) - f0) / h
                } else {
                    (f0 - shifted(j, -h)) / h
                }
            };
            jac.set_column(j, &column);
        }
        jac
    }
    fn projected_gradient_norm(g: &DVector<f64>, p: &DVector<f64>, bounds: &Bounds) -> f64 {
        g.iter()
            .zip(p.iter())
            .zip(bounds.lower.iter().zip(bounds.upper.iter()))
            .map(|((&g, &x), (&lo, &hi))| {
                if (x <= lo && g > 0f64) || (x >= hi && g < 0f64) {
                    0f64
                } else {
                    g.abs()
                }
            })
            .fold(0f64, f64::max)
    }
    fn solution<F>(
        &self,
        model: &F,
        p: DVector<f64>,
        f: &DVector<f64>,
        cost: f64,
        iterations: usize,
        bounds: &Bounds,
    ) -> Solution
    where
        F: Fn(&DVector<f64>) -> DVector<f64>,
    {
        let (m, n) = (f.len(), p.len());
        let covariance = if m > n {
            let jac = self.jacobian(model, &p, f, bounds);
            jac.tr_mul(&jac)
                .try_inverse()
                .map(|inv| inv * (2f64 * cost / (m - n) as f64))
        } else {
            None
        };
        Solution {
            params: p,
            cost,
            iterations,
            covariance,
        }
    }
    /// Minimizes `½‖model(p) - data‖²` starting from `p0` within `bounds`
    pub fn minimize<F>(
        &self,
        model: F,
        data: &DVector<f64>,
        p0: &DVector<f64>,
        bounds: &Bounds,
    ) -> Result<Solution>
    where
        F: Fn(&DVector<f64>) -> DVector<f64>,
    {
        let mut p = bounds.clamp(p0);
        let mut f = model(&p);
        if !is_finite(&f) {
            return Err(SolverError::NonFinite);
        }
        let mut cost = 0.5 * (&f - data).norm_squared();
        let mut lambda = self.lambda;

        for iteration in 0..self.max_iterations {
            let r = &f - data;
            let jac = self.jacobian(&model, &p, &f, bounds);
            let mut jtj = jac.tr_mul(&jac);
            let mut g = jac.tr_mul(&r);
            let diag = jtj.diagonal();
            let floor = FROZEN_COLUMN * diag.max();
            let frozen: Vec<usize> = (0..diag.len()).filter(|&j| diag[j] <= floor).collect();
            // a frozen parameter gets a unit diagonal, no damping and no gradient: its step is zero
            let mut scale = diag.clone();
            for &j in &frozen {
                jtj.row_mut(j).fill(0f64);
                jtj.column_mut(j).fill(0f64);
                jtj[(j, j)] = 1f64;
                g[j] = 0f64;
                scale[j] = 0f64;
            }
            if Self::projected_gradient_norm(&g, &p, bounds) <= self.gtol {
                return Ok(self.solution(&model, p, &f, cost, iteration, bounds));
            }
            let diag = jtj.diagonal();

            loop {
                let mut h = jtj.clone();
                h.set_diagonal(&(&diag + &scale * lambda));
                let Some(step) = h.cholesky().map(|ch| ch.solve(&(-&g))) else {
                    lambda *= 10f64;
                    if lambda > LAMBDA_MAX {
                        return Ok(self.solution(&model, p, &f, cost, iteration, bounds));
                    }
                    continue;
                };
                let p_new = bounds.clamp(&(&p + step));
                let dp = (&p_new - &p).norm();
                if dp <= self.xtol * (self.xtol + p.norm()) {
                    return Ok(self.solution(&model, p, &f, cost, iteration + 1, bounds));
                }
                let f_new = model(&p_new);
                let cost_new = if is_finite(&f_new) {
                    0.5 * (&f_new - data).norm_squared()
                } else {
                    f64::INFINITY
                };
                if cost_new < cost {
                    let reduction = cost - cost_new;
                    let previous = cost;
                    p = p_new;
                    f = f_new;
                    cost = cost_new;
                    lambda = (lambda / 10f64).max(LAMBDA_MIN);
                    if reduction <= self.ftol * previous {
                        return Ok(self.solution(&model, p, &f, cost, iteration + 1, bounds));
                    }
                    break;
                }
                lambda *= 10f64;
                if lambda > LAMBDA_MAX {
                    return Ok(self.solution(&model, p, &f, cost, iteration + 1, bounds));
                }
            }
        }
        Err(SolverError::MaxIterations(self.max_iterations))
    }
}
