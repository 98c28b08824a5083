/// Robust loss `rho(s)` applied to the squared norm `s` of each residual block.
///
/// The objective is `0.5 * sum(rho(s_i))`. Linearisation uses the IRLS weight
/// `rho'(s)`: residuals and Jacobian rows are scaled by its square root.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RobustLoss {
    /// Plain least squares, `rho(s) = s`.
    Trivial,
    /// Quadratic up to `threshold`, linear beyond it.
    Huber { threshold: f64 },
}

impl Default for RobustLoss {
    fn default() -> Self {
        RobustLoss::Huber { threshold: 0.05 }
    }
}

impl RobustLoss {
    /// Returns `(rho(s), rho'(s))` for a squared residual norm `s`.
    pub fn rho_and_weight(self, s: f64) -> (f64, f64) {
        match self {
            RobustLoss::Trivial => (s, 1.0),
            RobustLoss::Huber { threshold } => {
                let b = threshold * threshold;
                if s > b {
                    let r = s.sqrt();
                    (2.0 * threshold * r - b, threshold / r)
                } else {
                    (s, 1.0)
                }
            }
        }
    }

    pub fn rho(self, s: f64) -> f64 {
        self.rho_and_weight(s).0
    }
}
