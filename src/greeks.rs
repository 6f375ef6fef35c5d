// =============================================================================
// Black-Scholes option pricing — used by the delta-targeted option search.
// =============================================================================
//
// `norm_cdf` uses the Abramowitz & Stegun 7.1.26 rational approximation
// rather than pulling in a statistics crate, mirroring the reference
// implementation's own choice.

const NEWTON_MAX_ITER: u32 = 20;
const PRICE_PRECISION: f64 = 1e-4;
const SIGMA_MIN: f64 = 0.01;
const SIGMA_MAX: f64 = 5.0;
const VEGA_FLOOR: f64 = 1e-8;

pub fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Abramowitz & Stegun 7.1.26 rational approximation, accurate to ~7.5e-8.
pub fn norm_cdf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    0.5 * (1.0 + sign * y)
}

fn d1_d2(spot: f64, strike: f64, rate: f64, dividend: f64, sigma: f64, t: f64) -> (f64, f64) {
    let d1 = ((spot / strike).ln() + (rate - dividend + 0.5 * sigma * sigma) * t) / (sigma * t.sqrt());
    let d2 = d1 - sigma * t.sqrt();
    (d1, d2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Call,
    Put,
}

/// Theoretical price under Black-Scholes with a continuous dividend yield.
pub fn price(spot: f64, strike: f64, rate: f64, dividend: f64, sigma: f64, t: f64, kind: OptionKind) -> f64 {
    if t <= 0.0 || sigma <= 0.0 {
        return match kind {
            OptionKind::Call => (spot - strike).max(0.0),
            OptionKind::Put => (strike - spot).max(0.0),
        };
    }
    let (d1, d2) = d1_d2(spot, strike, rate, dividend, sigma, t);
    match kind {
        OptionKind::Call => {
            spot * (-dividend * t).exp() * norm_cdf(d1) - strike * (-rate * t).exp() * norm_cdf(d2)
        }
        OptionKind::Put => {
            strike * (-rate * t).exp() * norm_cdf(-d2) - spot * (-dividend * t).exp() * norm_cdf(-d1)
        }
    }
}

/// `e^{-qT}`-adjusted delta.
pub fn delta(spot: f64, strike: f64, rate: f64, dividend: f64, sigma: f64, t: f64, kind: OptionKind) -> f64 {
    if t <= 0.0 || sigma <= 0.0 {
        return match kind {
            OptionKind::Call => {
                if spot > strike {
                    1.0
                } else {
                    0.0
                }
            }
            OptionKind::Put => {
                if spot < strike {
                    -1.0
                } else {
                    0.0
                }
            }
        };
    }
    let (d1, _) = d1_d2(spot, strike, rate, dividend, sigma, t);
    let discount = (-dividend * t).exp();
    match kind {
        OptionKind::Call => discount * norm_cdf(d1),
        OptionKind::Put => discount * (norm_cdf(d1) - 1.0),
    }
}

pub fn vega(spot: f64, strike: f64, rate: f64, dividend: f64, sigma: f64, t: f64) -> f64 {
    if t <= 0.0 || sigma <= 0.0 {
        return 0.0;
    }
    let (d1, _) = d1_d2(spot, strike, rate, dividend, sigma, t);
    spot * (-dividend * t).exp() * norm_pdf(d1) * t.sqrt()
}

/// Newton-Raphson solve for implied volatility. Sigma is clamped to
/// `[0.01, 5.0]` at every step; if vega collapses near zero the last sigma
/// is returned rather than dividing by ~0.
pub fn implied_volatility(
    market_price: f64,
    spot: f64,
    strike: f64,
    rate: f64,
    dividend: f64,
    t: f64,
    kind: OptionKind,
) -> f64 {
    let mut sigma = 0.2;
    for _ in 0..NEWTON_MAX_ITER {
        let model_price = price(spot, strike, rate, dividend, sigma, t, kind);
        let diff = model_price - market_price;
        if diff.abs() < PRICE_PRECISION {
            return sigma;
        }
        let v = vega(spot, strike, rate, dividend, sigma, t);
        if v.abs() < VEGA_FLOOR {
            return sigma;
        }
        sigma -= diff / v;
        sigma = sigma.clamp(SIGMA_MIN, SIGMA_MAX);
    }
    sigma
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_cdf_matches_known_values() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((norm_cdf(1.959964) - 0.975).abs() < 1e-3);
    }

    #[test]
    fn atm_call_and_put_prices_satisfy_put_call_parity() {
        let spot = 100.0;
        let strike = 100.0;
        let rate = 0.02;
        let dividend = 0.0;
        let sigma = 0.2;
        let t = 30.0 / 365.0;
        let call = price(spot, strike, rate, dividend, sigma, t, OptionKind::Call);
        let put = price(spot, strike, rate, dividend, sigma, t, OptionKind::Put);
        let lhs = call - put;
        let rhs = spot * (-dividend * t).exp() - strike * (-rate * t).exp();
        assert!((lhs - rhs).abs() < 1e-6);
    }

    #[test]
    fn call_delta_is_between_zero_and_one() {
        let d = delta(100.0, 100.0, 0.02, 0.0, 0.2, 30.0 / 365.0, OptionKind::Call);
        assert!(d > 0.0 && d < 1.0);
    }

    #[test]
    fn put_delta_is_between_minus_one_and_zero() {
        let d = delta(100.0, 100.0, 0.02, 0.0, 0.2, 30.0 / 365.0, OptionKind::Put);
        assert!(d > -1.0 && d < 0.0);
    }

    #[test]
    fn implied_volatility_recovers_known_sigma() {
        let spot = 4500.0;
        let strike = 4500.0;
        let rate = 0.04;
        let dividend = 0.015;
        let t = 1.0 / 365.0;
        let true_sigma = 0.18;
        let market_price = price(spot, strike, rate, dividend, true_sigma, t, OptionKind::Call);
        let recovered = implied_volatility(market_price, spot, strike, rate, dividend, t, OptionKind::Call);
        assert!((recovered - true_sigma).abs() < 1e-3);
    }

    #[test]
    fn implied_volatility_never_escapes_clamp_bounds() {
        // Deliberately unreachable market price forces the solver to the
        // clamp rather than diverging.
        let iv = implied_volatility(10_000.0, 100.0, 100.0, 0.02, 0.0, 1.0 / 365.0, OptionKind::Call);
        assert!(iv >= SIGMA_MIN && iv <= SIGMA_MAX);
    }
}
