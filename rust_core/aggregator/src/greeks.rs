//! Black-Scholes pricing for index and stock options.

use std::f64::consts::{PI, SQRT_2};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;

pub const DEFAULT_RISK_FREE_RATE: f64 = 0.06;

/// 15:30 IST.
const EXPIRY_HOUR_UTC: u32 = 10;
const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

const IV_START: f64 = 0.20;
const IV_MAX_ITERATIONS: usize = 100;
const IV_TOLERANCE: f64 = 1e-4;
const IV_FLOOR: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

/// Everything but the volatility.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionInputs {
    pub kind: OptionType,
    pub spot: f64,
    pub strike: f64,
    /// Time to expiry in years.
    pub years: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    /// Per calendar day.
    pub theta: f64,
    /// Per one point of volatility.
    pub vega: f64,
}

fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}

fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

impl OptionInputs {
    fn is_priceable(&self) -> bool {
        self.spot > 0.0 && self.strike > 0.0 && self.years > 0.0
    }

    fn d1_d2(&self, vol: f64) -> (f64, f64) {
        let sqrt_t = self.years.sqrt();
        let d1 = ((self.spot / self.strike).ln() + (self.rate + 0.5 * vol * vol) * self.years)
            / (vol * sqrt_t);
        (d1, d1 - vol * sqrt_t)
    }

    fn discounted_strike(&self) -> f64 {
        self.strike * (-self.rate * self.years).exp()
    }
}

pub fn black_scholes_price(inputs: &OptionInputs, vol: f64) -> f64 {
    if !inputs.is_priceable() || vol <= 0.0 {
        let (intrinsic, _) = intrinsic_and_time_value(inputs.kind, inputs.spot, inputs.strike, 0.0);
        return intrinsic;
    }
    let (d1, d2) = inputs.d1_d2(vol);
    match inputs.kind {
        OptionType::Call => inputs.spot * norm_cdf(d1) - inputs.discounted_strike() * norm_cdf(d2),
        OptionType::Put => inputs.discounted_strike() * norm_cdf(-d2) - inputs.spot * norm_cdf(-d1),
    }
}

/// All zero when the inputs cannot be priced.
pub fn greeks(inputs: &OptionInputs, vol: f64) -> Greeks {
    if !inputs.is_priceable() || vol <= 0.0 {
        return Greeks::default();
    }
    let (d1, d2) = inputs.d1_d2(vol);
    let sqrt_t = inputs.years.sqrt();
    let pdf_d1 = norm_pdf(d1);
    let decay = -(inputs.spot * pdf_d1 * vol) / (2.0 * sqrt_t);
    let carry = inputs.rate * inputs.discounted_strike();

    let (delta, theta_annual) = match inputs.kind {
        OptionType::Call => (norm_cdf(d1), decay - carry * norm_cdf(d2)),
        OptionType::Put => (norm_cdf(d1) - 1.0, decay + carry * norm_cdf(-d2)),
    };

    Greeks {
        delta,
        gamma: pdf_d1 / (inputs.spot * vol * sqrt_t),
        theta: theta_annual / 365.0,
        vega: inputs.spot * pdf_d1 * sqrt_t / 100.0,
    }
}

/// Newton-Raphson from 20% volatility. `None` when the premium cannot be
/// matched, e.g. it sits below the discounted intrinsic value.
pub fn implied_volatility(inputs: &OptionInputs, premium: f64) -> Option<f64> {
    if !inputs.is_priceable() || premium <= 0.0 {
        return None;
    }
    let mut vol = IV_START;
    for _ in 0..IV_MAX_ITERATIONS {
        let (d1, _) = inputs.d1_d2(vol);
        // dPrice/dVol, not the per-point vega reported in `Greeks`.
        let slope = inputs.spot * norm_pdf(d1) * inputs.years.sqrt();
        if slope < 1e-8 {
            return None;
        }
        let mut next = vol - (black_scholes_price(inputs, vol) - premium) / slope;
        if next <= 0.0 {
            next = IV_FLOOR;
        }
        if (next - vol).abs() < IV_TOLERANCE {
            return Some(next);
        }
        vol = next;
    }
    None
}

/// `(intrinsic, time value)`; time value never goes negative.
pub fn intrinsic_and_time_value(
    kind: OptionType,
    spot: f64,
    strike: f64,
    premium: f64,
) -> (f64, f64) {
    let intrinsic = match kind {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    };
    (intrinsic, (premium - intrinsic).max(0.0))
}

/// Years from `now` until the close of trading on `expiry`, floored at zero.
pub fn time_to_expiry(expiry: NaiveDate, now: DateTime<Utc>) -> f64 {
    let close = match expiry.and_hms_opt(EXPIRY_HOUR_UTC, 0, 0) {
        Some(close) => Utc.from_utc_datetime(&close),
        None => return 0.0,
    };
    let seconds = (close - now).num_seconds();
    if seconds <= 0 {
        0.0
    } else {
        seconds as f64 / SECONDS_PER_YEAR
    }
}
