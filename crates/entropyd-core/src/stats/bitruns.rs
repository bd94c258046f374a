//! Bit run-length histogram with a chi-squared fit against the geometric
//! distribution a random bit stream would produce.

use serde::{Deserialize, Serialize};

use crate::stats::chisq_pvalue;

/// Runs longer than this are clamped into the final histogram cell.
pub const MAX_RUN: usize = 64;

/// Cells with an expected count under this are excluded from the fit.
const EXPECT_CUTOFF: f64 = 5.0;

/// Per-bit-value run-length histogram over an unbounded bit stream.
///
/// Bits are consumed most-significant first. A run is closed (and counted)
/// when the opposite bit value arrives; the final run of a stream stays
/// open and is reported separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitRuns {
    #[serde(rename = "Runs")]
    runs: [Vec<u64>; 2],
    #[serde(rename = "Zeros")]
    zeros: u64,
    #[serde(rename = "Ones")]
    ones: u64,
    #[serde(rename = "OpenBit")]
    open_bit: u8,
    #[serde(rename = "OpenLen")]
    open_len: u64,
}

impl Default for BitRuns {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived chi-squared fit of the histogram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BitRunsFit {
    #[serde(rename = "Chisq")]
    pub chisq: f64,
    #[serde(rename = "Chisq-p")]
    pub chisq_p: f64,
    #[serde(rename = "Chisq-k")]
    pub dof: u64,
}

impl BitRuns {
    pub fn new() -> Self {
        Self {
            runs: [vec![0; MAX_RUN], vec![0; MAX_RUN]],
            zeros: 0,
            ones: 0,
            open_bit: 0,
            open_len: 0,
        }
    }

    pub fn zeros(&self) -> u64 {
        self.zeros
    }

    pub fn ones(&self) -> u64 {
        self.ones
    }

    pub fn runs(&self, bit: u8, len: usize) -> u64 {
        self.runs[(bit & 1) as usize][len.clamp(1, MAX_RUN) - 1]
    }

    /// Consume a chunk of the bit stream, most-significant bit first.
    pub fn feed(&mut self, buf: &[u8]) {
        for &byte in buf {
            for shift in (0..8).rev() {
                let bit = (byte >> shift) & 1;
                if bit == 1 {
                    self.ones += 1;
                } else {
                    self.zeros += 1;
                }
                if self.open_len == 0 {
                    self.open_bit = bit;
                    self.open_len = 1;
                } else if bit == self.open_bit {
                    self.open_len += 1;
                } else {
                    self.close_run();
                    self.open_bit = bit;
                    self.open_len = 1;
                }
            }
        }
    }

    fn close_run(&mut self) {
        let cell = (self.open_len as usize).min(MAX_RUN) - 1;
        self.runs[self.open_bit as usize][cell] += 1;
    }

    /// Expected count of runs of exactly `len` for one bit value, given the
    /// stream length seen so far.
    pub fn expected(&self, len: usize) -> f64 {
        let nbits = (self.zeros + self.ones) as f64;
        (nbits - len as f64 + 2.0) / 2f64.powi(len as i32 + 2)
    }

    /// Chi-squared fit against the geometric run-length distribution,
    /// covering every cell whose expectation clears the conventional
    /// five-count floor. Degrees of freedom are `2 * i_max - 1`.
    pub fn fit(&self) -> BitRunsFit {
        let mut chisq = 0.0;
        let mut imax = 0usize;
        for len in 1..=MAX_RUN {
            let expect = self.expected(len);
            if expect < EXPECT_CUTOFF {
                break;
            }
            imax = len;
            for bit in 0..2 {
                let d = self.runs[bit][len - 1] as f64 - expect;
                chisq += d * d / expect;
            }
        }
        let dof = if imax == 0 { 0 } else { (2 * imax - 1) as u64 };
        BitRunsFit {
            chisq,
            chisq_p: chisq_pvalue(chisq, dof),
            dof,
        }
    }

    /// Canonical JSON report: totals, per-length rows of
    /// `[zeros, ones, expected]`, and the chi-squared fit.
    pub fn report(&self) -> serde_json::Value {
        let fit = self.fit();
        let rows: Vec<serde_json::Value> = (1..=MAX_RUN)
            .map(|len| {
                serde_json::json!([
                    self.runs[0][len - 1],
                    self.runs[1][len - 1],
                    self.expected(len)
                ])
            })
            .collect();
        serde_json::json!({
            "Zeros": self.zeros,
            "Ones": self.ones,
            "Max": MAX_RUN,
            "Runs": rows,
            "Chisq": fit.chisq,
            "Chisq-p": fit.chisq_p,
            "Chisq-k": fit.dof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{RngCore, SeedableRng, rngs::StdRng};

    #[test]
    fn counts_alternating_bits() {
        let mut br = BitRuns::new();
        br.feed(&[0b10101010; 4]); // 32 alternating bits
        assert_eq!(br.ones, 16);
        assert_eq!(br.zeros, 16);
        // 31 closed runs of length 1 (the final zero stays open).
        assert_eq!(br.runs(1, 1), 16);
        assert_eq!(br.runs(0, 1), 15);
        assert_eq!(br.open_len, 1);
        assert_eq!(br.open_bit, 0);
    }

    #[test]
    fn clamps_long_runs() {
        let mut br = BitRuns::new();
        br.feed(&[0xFF; 16]); // 128 ones
        br.feed(&[0x00]); // closes the run
        assert_eq!(br.runs(1, MAX_RUN), 1);
        assert_eq!(br.runs(1, 1), 0);
    }

    #[test]
    fn runs_span_feed_boundaries() {
        let mut br = BitRuns::new();
        br.feed(&[0x0F]); // ...0000 1111
        br.feed(&[0xF0]); // 1111 0000...
        br.feed(&[0x00]);
        // One run of 8 ones closed by the trailing zeros.
        assert_eq!(br.runs(1, 8), 1);
        assert_eq!(br.runs(0, 4), 1);
    }

    #[test]
    fn geometric_fit_on_random_stream() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut buf = vec![0u8; 1 << 17];
        rng.fill_bytes(&mut buf);
        let mut br = BitRuns::new();
        br.feed(&buf);

        let fit = br.fit();
        assert!(fit.dof > 10, "dof {}", fit.dof);
        // chi-squared of a healthy stream stays within a wide band around
        // its dof.
        assert!(fit.chisq < fit.dof as f64 * 3.0 + 50.0, "chisq {}", fit.chisq);
        assert!(fit.chisq_p > 1e-6);
    }

    #[test]
    fn structured_stream_fails_fit() {
        // Strictly alternating bits have no runs longer than 1 at all.
        let mut br = BitRuns::new();
        br.feed(&vec![0b01010101u8; 1 << 15]);
        let fit = br.fit();
        assert!(fit.chisq_p < 1e-9, "p {}", fit.chisq_p);
    }

    #[test]
    fn report_shape() {
        let mut br = BitRuns::new();
        br.feed(&[0xA5, 0x3C]);
        let v = br.report();
        assert_eq!(v["Max"], MAX_RUN);
        assert_eq!(v["Runs"].as_array().unwrap().len(), MAX_RUN);
        assert_eq!(v["Zeros"].as_u64().unwrap() + v["Ones"].as_u64().unwrap(), 16);
        assert!(v.get("Chisq-k").is_some());
    }

    #[test]
    fn serde_round_trip() {
        let mut a = BitRuns::new();
        a.feed(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let json = serde_json::to_string(&a).unwrap();
        let mut b: BitRuns = serde_json::from_str(&json).unwrap();
        assert_eq!(a, b);
        a.feed(&[0x55]);
        b.feed(&[0x55]);
        assert_eq!(a, b);
    }
}
