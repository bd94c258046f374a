//! Online statistical analysers for raw entropy streams.
//!
//! Three analysers share this module: the ENT-style running suite
//! ([`ent::Ent`]), the bit run-length histogram ([`bitruns::BitRuns`]) and
//! the FIPS 140-2 continuous tests ([`fips::Fips`]). Each consumes a byte
//! stream incrementally and keeps both per-block and long-running state.

pub mod bitruns;
pub mod ent;
pub mod fips;

use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Upper-tail p-value of a chi-squared statistic with `dof` degrees of
/// freedom. Degenerate inputs report 1.0 (no evidence against the null).
pub fn chisq_pvalue(chisq: f64, dof: u64) -> f64 {
    if dof == 0 || !chisq.is_finite() || chisq <= 0.0 {
        return 1.0;
    }
    match ChiSquared::new(dof as f64) {
        Ok(dist) => (1.0 - dist.cdf(chisq)).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}
