use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Explicit Runge-Kutta coefficients.
///
/// `a` holds the strictly lower triangular rows, row `s` giving the weights
/// of stages `0..s` used to build stage `s`.
#[derive(Debug, Clone, PartialEq)]
pub struct ButcherTableau {
    pub c: Vec<f64>,
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
}

impl ButcherTableau {
    /// Classic fourth-order Runge-Kutta.
    pub fn rk4() -> Self {
        Self {
            c: vec![0.0, 0.5, 0.5, 1.0],
            a: vec![vec![], vec![0.5], vec![0.0, 0.5], vec![0.0, 0.0, 1.0]],
            b: vec![1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
        }
    }

    /// Tsitouras 5/4, propagating the fifth-order solution.
    pub fn tsit5() -> Self {
        let b = vec![
            0.09646076681806523,
            0.01,
            0.4798896504144996,
            1.379008574103742,
            -3.290069515436099,
            2.324710524099774,
        ];
        Self {
            c: vec![0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0],
            a: vec![
                vec![],
                vec![0.161],
                vec![-0.008480655492356989, 0.335480655492357],
                vec![2.897153057105493, -6.359448489975075, 4.3622954328695815],
                vec![
                    5.325864828439257,
                    -11.748883564062828,
                    7.495539342889836,
                    -0.09249506636175525,
                ],
                vec![
                    5.86145544294642,
                    -12.92096931784711,
                    8.159367898576159,
                    -0.071584973281401,
                    -0.028269050394068383,
                ],
            ],
            b,
        }
    }

    pub fn stages(&self) -> usize {
        self.b.len()
    }
}

/// Fixed-step explicit Runge-Kutta stepper over any tableau.
pub struct RungeKutta<T: Scalar> {
    tableau: ButcherTableau,
    k: Vec<Vec<T>>,
    tmp: Vec<T>,
}

impl<T: Scalar> RungeKutta<T> {
    pub fn new(tableau: ButcherTableau, dim: usize) -> Self {
        let stages = tableau.stages();
        Self {
            tableau,
            k: vec![vec![T::zero(); dim]; stages],
            tmp: vec![T::zero(); dim],
        }
    }

    pub fn rk4(dim: usize) -> Self {
        Self::new(ButcherTableau::rk4(), dim)
    }

    pub fn tsit5(dim: usize) -> Self {
        Self::new(ButcherTableau::tsit5(), dim)
    }
}

impl<T: Scalar> Steppable<T> for RungeKutta<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let t0 = *t;
        for s in 0..self.tableau.stages() {
            for i in 0..state.len() {
                let mut acc = T::zero();
                for (j, &weight) in self.tableau.a[s].iter().enumerate() {
                    if weight != 0.0 {
                        acc = acc + T::of(weight) * self.k[j][i];
                    }
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            let (_, rest) = self.k.split_at_mut(s);
            system.apply(t0 + T::of(self.tableau.c[s]) * dt, &self.tmp, &mut rest[0]);
        }

        for i in 0..state.len() {
            let mut acc = T::zero();
            for (s, &weight) in self.tableau.b.iter().enumerate() {
                acc = acc + T::of(weight) * self.k[s][i];
            }
            state[i] = state[i] + dt * acc;
        }
        *t = t0 + dt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// dx/dt = -x
    struct Decay;

    impl DynamicalSystem<f64> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -x[0];
        }
    }

    fn integrate(mut stepper: RungeKutta<f64>, steps: usize) -> f64 {
        let mut t = 0.0;
        let mut x = [1.0];
        let dt = 1.0 / steps as f64;
        for _ in 0..steps {
            stepper.step(&Decay, &mut t, &mut x, dt);
        }
        assert!((t - 1.0).abs() < 1e-12);
        x[0]
    }

    #[test]
    fn tableaus_are_consistent() {
        for tableau in [ButcherTableau::rk4(), ButcherTableau::tsit5()] {
            let total: f64 = tableau.b.iter().sum();
            assert!((total - 1.0).abs() < 1e-12);
            for (row, c) in tableau.a.iter().zip(&tableau.c) {
                let sum: f64 = row.iter().sum();
                assert!((sum - c).abs() < 1e-12, "row sum {sum} vs c {c}");
            }
        }
    }

    #[test]
    fn rk4_reaches_fourth_order_accuracy() {
        let error = (integrate(RungeKutta::rk4(1), 20) - (-1.0f64).exp()).abs();
        assert!(error < 1e-7, "error = {error}");
    }

    #[test]
    fn tsit5_beats_rk4_at_equal_steps() {
        let exact = (-1.0f64).exp();
        let rk4 = (integrate(RungeKutta::rk4(1), 10) - exact).abs();
        let tsit5 = (integrate(RungeKutta::tsit5(1), 10) - exact).abs();
        assert!(tsit5 < rk4, "tsit5 {tsit5} vs rk4 {rk4}");
    }
}
