//! ENT-style running statistical suite, parameterised on symbol width.
//!
//! [`Ent<8>`] analyses the byte stream directly; [`Ent<16>`] analyses
//! consecutive big-endian byte pairs. Both maintain a *short* per-block
//! accumulator that flushes into a *long* running accumulator every
//! `short_block` samples, so a channel is judged both on its most recent
//! block and on everything it has produced since startup.
//!
//! Counters are 64-bit integers; when a long-term counter approaches
//! overflow the accumulator is halved with a chi-square-preserving
//! normalisation instead of a plain shift, which would bias the long-term
//! statistic toward zero over time.

use serde::{Deserialize, Serialize};

use crate::stats::chisq_pvalue;

/// Samples per short block for the 8-bit suite.
pub const ENT8_SHORT_BLOCK: u64 = 500_000;
/// Samples per short block for the 16-bit suite.
pub const ENT16_SHORT_BLOCK: u64 = 100_000_000;

/// 8-bit long-term gating watermark: 250 MiB of data, one sample per byte.
pub const ENT8_LONG_MINSAMPLES: u64 = 250 * 1024 * 1024;
/// 16-bit long-term gating watermark: 800 MiB of data, one sample per pair.
pub const ENT16_LONG_MINSAMPLES: u64 = 400 * 1024 * 1024;

/// Monte-Carlo inclusion radius: (2^24 - 1)^2.
const INCIRCLE_R2: u64 = ((1u64 << 24) - 1) * ((1u64 << 24) - 1);

/// Normalise a long-term accumulator once any counter passes this mark.
const NORM_LIMIT: u64 = u64::MAX / 2;

/// Skip the pi check below this accumulation floor; the estimate is
/// meaningless on a handful of points.
const PI_EVAL_FLOOR: u64 = 1_000;

/// One set of running counters (short block or long term).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(rename = "Samples")]
    pub samples: u64,
    #[serde(rename = "Bins")]
    pub bins: Vec<u64>,
    #[serde(rename = "PiSamples")]
    pub pisamples: u64,
    #[serde(rename = "PiIn")]
    pub inradius: u64,
    /// First sample of this accumulation; `None` until data arrives.
    #[serde(rename = "Corr0")]
    pub corr0: Option<u64>,
    #[serde(rename = "Corr1")]
    pub corr1: u64,
    #[serde(rename = "Corr2")]
    pub corr2: u64,
    #[serde(rename = "Corr3")]
    pub corr3: u64,
    /// Most recent sample.
    #[serde(rename = "CorrN")]
    pub corrn: u64,
}

impl Counters {
    fn new(nbins: usize) -> Self {
        Self {
            samples: 0,
            bins: vec![0; nbins],
            pisamples: 0,
            inradius: 0,
            corr0: None,
            corr1: 0,
            corr2: 0,
            corr3: 0,
            corrn: 0,
        }
    }
}

/// Derived metrics of one accumulator state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(rename = "Entropy")]
    pub entropy: f64,
    #[serde(rename = "Chisq")]
    pub chisq: f64,
    #[serde(rename = "Chisq-p")]
    pub chisq_p: f64,
    #[serde(rename = "Mean")]
    pub mean: f64,
    #[serde(rename = "Pi")]
    pub pi: f64,
    #[serde(rename = "Pi-error")]
    pub pi_error: f64,
    #[serde(rename = "Autocorr")]
    pub autocorr: f64,
    #[serde(rename = "MinEntropy")]
    pub minentropy: f64,
}

/// Per-metric failed-block counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailCounts {
    #[serde(rename = "Tested")]
    pub tested: u64,
    #[serde(rename = "Entropy")]
    pub entropy: u64,
    #[serde(rename = "Chisq")]
    pub chisq: u64,
    #[serde(rename = "Mean")]
    pub mean: u64,
    #[serde(rename = "Pi")]
    pub pi: u64,
    #[serde(rename = "Corr")]
    pub corr: u64,
    #[serde(rename = "MinEntropy")]
    pub minentropy: u64,
}

/// Acceptance bounds for one accumulator scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub entropy_min: f64,
    pub chisq_min: f64,
    pub chisq_max: f64,
    pub mean_tolerance: f64,
    pub pi_tolerance: f64,
    pub corr_tolerance: f64,
    pub minentropy_min: f64,
}

/// Failure thresholds and hysteresis tuning for one symbol width.
///
/// The defaults are empirical: the short bounds sit near the 1-in-1e8 tail
/// of each statistic for a healthy source, the long bounds near 1-in-1e6 at
/// the `long_minsamples` watermark. They are exposed as tunables rather than
/// constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntLimits {
    pub short: Bounds,
    pub long: Bounds,
    /// Samples the long accumulator needs before its bounds gate the channel.
    pub long_minsamples: u64,
    /// Samples per short block.
    pub short_block: u64,
    /// Consecutive clean flushes required to leave the not-ok state.
    pub recover_flushes: u32,
}

impl EntLimits {
    pub fn ent8() -> Self {
        Self {
            short: Bounds {
                entropy_min: 7.9993,
                chisq_min: 145.0,
                chisq_max: 405.0,
                mean_tolerance: 0.60,
                pi_tolerance: 0.032,
                corr_tolerance: 0.008,
                minentropy_min: 7.80,
            },
            long: Bounds {
                entropy_min: 7.99999,
                chisq_min: 160.0,
                chisq_max: 380.0,
                mean_tolerance: 0.022,
                pi_tolerance: 0.0012,
                corr_tolerance: 0.0003,
                minentropy_min: 7.985,
            },
            long_minsamples: ENT8_LONG_MINSAMPLES,
            short_block: ENT8_SHORT_BLOCK,
            recover_flushes: 5,
        }
    }

    pub fn ent16() -> Self {
        Self {
            short: Bounds {
                entropy_min: 15.9994,
                chisq_min: 63_500.0,
                chisq_max: 67_600.0,
                mean_tolerance: 11.0,
                pi_tolerance: 0.0016,
                corr_tolerance: 0.00056,
                minentropy_min: 15.70,
            },
            long: Bounds {
                entropy_min: 15.9998,
                chisq_min: 63_900.0,
                chisq_max: 67_200.0,
                mean_tolerance: 4.5,
                pi_tolerance: 0.0007,
                corr_tolerance: 0.00023,
                minentropy_min: 15.82,
            },
            long_minsamples: ENT16_LONG_MINSAMPLES,
            short_block: ENT16_SHORT_BLOCK,
            recover_flushes: 5,
        }
    }
}

/// Running ENT suite for symbols of `BITS` bits (8 or 16).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ent<const BITS: u32> {
    /// Long-term accumulator, flattened so the persisted form exposes
    /// `Samples`, `Bins`, `PiSamples`, `PiIn` and the `Corr*` fields at the
    /// top level.
    #[serde(flatten)]
    long: Counters,
    #[serde(rename = "Short")]
    short: Counters,
    #[serde(rename = "Current")]
    current: Metrics,
    #[serde(rename = "Min")]
    min: Metrics,
    #[serde(rename = "Max")]
    max: Metrics,
    #[serde(rename = "Failed")]
    failed: FailCounts,
    #[serde(rename = "Ok")]
    ok: bool,
    #[serde(rename = "GoodFlushes")]
    good_flushes: u32,
    #[serde(rename = "Flushes")]
    flushes: u64,
    /// Set once the long accumulator has crossed `long_minsamples`; the
    /// min/max extrema are reset at that watermark so startup transients do
    /// not pin them forever.
    #[serde(rename = "LongActive")]
    long_active: bool,
    /// Pending low half of a 16-bit symbol.
    #[serde(rename = "Pending")]
    pending: Option<u8>,
    /// Staged bytes of the current 6-byte Monte-Carlo tuple.
    #[serde(rename = "Monte")]
    monte: Vec<u8>,
    #[serde(rename = "Limits")]
    limits: EntLimits,
}

impl Ent<8> {
    pub fn new(initial_ok: bool) -> Self {
        Self::with_limits(EntLimits::ent8(), initial_ok)
    }
}

impl Ent<16> {
    pub fn new(initial_ok: bool) -> Self {
        Self::with_limits(EntLimits::ent16(), initial_ok)
    }
}

impl<const BITS: u32> Ent<BITS> {
    const NBINS: usize = 1 << BITS;

    pub fn with_limits(limits: EntLimits, initial_ok: bool) -> Self {
        Self {
            long: Counters::new(Self::NBINS),
            short: Counters::new(Self::NBINS),
            current: Metrics::default(),
            min: Metrics::default(),
            max: Metrics::default(),
            failed: FailCounts::default(),
            ok: initial_ok,
            good_flushes: 0,
            flushes: 0,
            long_active: false,
            pending: None,
            monte: Vec::with_capacity(6),
            limits,
        }
    }

    /// Hysteretic channel verdict. Turns false on the first failed flush,
    /// true again only after `recover_flushes` consecutive clean flushes.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn current(&self) -> &Metrics {
        &self.current
    }

    pub fn min(&self) -> &Metrics {
        &self.min
    }

    pub fn max(&self) -> &Metrics {
        &self.max
    }

    pub fn failed(&self) -> &FailCounts {
        &self.failed
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn limits(&self) -> &EntLimits {
        &self.limits
    }

    /// Consume a chunk of the raw byte stream.
    pub fn feed(&mut self, buf: &[u8]) {
        for &b in buf {
            // Monte-Carlo pi always works on the original byte stream,
            // six bytes per (x, y) point, regardless of symbol width.
            self.monte.push(b);
            if self.monte.len() == 6 {
                let x = (self.monte[0] as u64) << 16
                    | (self.monte[1] as u64) << 8
                    | self.monte[2] as u64;
                let y = (self.monte[3] as u64) << 16
                    | (self.monte[4] as u64) << 8
                    | self.monte[5] as u64;
                self.monte.clear();
                self.short.pisamples += 1;
                if x * x + y * y <= INCIRCLE_R2 {
                    self.short.inradius += 1;
                }
            }

            match BITS {
                8 => self.push_sample(b as u64),
                _ => {
                    if let Some(hi) = self.pending.take() {
                        self.push_sample((hi as u64) << 8 | b as u64);
                    } else {
                        self.pending = Some(b);
                    }
                }
            }
        }
    }

    fn push_sample(&mut self, s: u64) {
        let c = &mut self.short;
        c.bins[s as usize] += 1;
        if c.corr0.is_none() {
            c.corr0 = Some(s);
        } else {
            c.corr1 += c.corrn * s;
        }
        c.corr2 += s;
        c.corr3 += s * s;
        c.corrn = s;
        c.samples += 1;
        if c.samples >= self.limits.short_block {
            self.flush();
        }
    }

    /// Close the short block: derive metrics, judge them, merge the
    /// counters into the long accumulator and advance the hysteresis state.
    fn flush(&mut self) {
        let m = Self::compute(&self.short);
        self.failed.tested += 1;
        let mut clean = self.evaluate(&m, self.limits.short);

        self.merge_short_into_long();

        let crossed = !self.long_active && self.long.samples >= self.limits.long_minsamples;
        if crossed {
            self.long_active = true;
        }
        if self.long_active {
            let lm = Self::compute(&self.long);
            if !self.evaluate(&lm, self.limits.long) {
                clean = false;
            }
        }

        self.current = m;
        if self.flushes == 0 || crossed {
            self.min = m;
            self.max = m;
        } else {
            self.update_extrema(&m);
        }
        self.flushes += 1;

        if clean {
            self.good_flushes = self.good_flushes.saturating_add(1);
            if self.good_flushes >= self.limits.recover_flushes {
                self.ok = true;
            }
        } else {
            self.ok = false;
            self.good_flushes = 0;
        }

        if needs_normalize(&self.long) {
            normalize(&mut self.long);
        }
    }

    /// Check one metric set against a bounds table, bumping the failure
    /// counters. Returns true when every checked metric is inside bounds.
    fn evaluate(&mut self, m: &Metrics, b: Bounds) -> bool {
        let ideal_mean = (Self::NBINS as f64 - 1.0) / 2.0;
        let mut clean = true;
        if m.entropy < b.entropy_min {
            self.failed.entropy += 1;
            clean = false;
        }
        if m.chisq < b.chisq_min || m.chisq > b.chisq_max {
            self.failed.chisq += 1;
            clean = false;
        }
        if (m.mean - ideal_mean).abs() > b.mean_tolerance {
            self.failed.mean += 1;
            clean = false;
        }
        if m.autocorr.abs() > b.corr_tolerance {
            self.failed.corr += 1;
            clean = false;
        }
        // The pi estimate needs a reasonable point count before it can be
        // judged; a degenerate nonzero value is judged regardless.
        if (self.short.pisamples.max(self.long.pisamples) >= PI_EVAL_FLOOR || m.pi != 0.0)
            && (m.pi - std::f64::consts::PI).abs() > b.pi_tolerance
        {
            self.failed.pi += 1;
            clean = false;
        }
        if m.minentropy < b.minentropy_min {
            self.failed.minentropy += 1;
            clean = false;
        }
        clean
    }

    fn merge_short_into_long(&mut self) {
        let s = std::mem::replace(&mut self.short, Counters::new(Self::NBINS));
        let l = &mut self.long;
        for (dst, src) in l.bins.iter_mut().zip(s.bins.iter()) {
            *dst += *src;
        }
        l.samples += s.samples;
        l.pisamples += s.pisamples;
        l.inradius += s.inradius;
        l.corr1 += s.corr1;
        l.corr2 += s.corr2;
        l.corr3 += s.corr3;
        match (l.corr0, s.corr0) {
            (None, first) => l.corr0 = first,
            // Junction product: the last sample of the accumulated stream
            // meets the first sample of the flushed block.
            (Some(_), Some(first)) => l.corr1 += l.corrn * first,
            _ => {}
        }
        if s.samples > 0 {
            l.corrn = s.corrn;
        }
    }

    fn update_extrema(&mut self, m: &Metrics) {
        let ideal_mean = (Self::NBINS as f64 - 1.0) / 2.0;

        // Entropy, chi-squared and min-entropy record their plain extremes;
        // mean, pi and autocorrelation record the closest and farthest
        // values relative to their ideals.
        self.min.entropy = self.min.entropy.min(m.entropy);
        self.max.entropy = self.max.entropy.max(m.entropy);
        if m.chisq < self.min.chisq {
            self.min.chisq = m.chisq;
            self.min.chisq_p = m.chisq_p;
        }
        if m.chisq > self.max.chisq {
            self.max.chisq = m.chisq;
            self.max.chisq_p = m.chisq_p;
        }
        self.min.minentropy = self.min.minentropy.min(m.minentropy);
        self.max.minentropy = self.max.minentropy.max(m.minentropy);

        if (m.mean - ideal_mean).abs() < (self.min.mean - ideal_mean).abs() {
            self.min.mean = m.mean;
        }
        if (m.mean - ideal_mean).abs() > (self.max.mean - ideal_mean).abs() {
            self.max.mean = m.mean;
        }
        let pi = std::f64::consts::PI;
        if (m.pi - pi).abs() < (self.min.pi - pi).abs() {
            self.min.pi = m.pi;
            self.min.pi_error = m.pi_error;
        }
        if (m.pi - pi).abs() > (self.max.pi - pi).abs() {
            self.max.pi = m.pi;
            self.max.pi_error = m.pi_error;
        }
        if m.autocorr.abs() < self.min.autocorr.abs() {
            self.min.autocorr = m.autocorr;
        }
        if m.autocorr.abs() > self.max.autocorr.abs() {
            self.max.autocorr = m.autocorr;
        }
    }

    /// Derive the metric set of one accumulator.
    fn compute(c: &Counters) -> Metrics {
        if c.samples == 0 {
            return Metrics {
                autocorr: 1.0,
                ..Metrics::default()
            };
        }
        let n = c.samples as f64;
        let nbins = c.bins.len() as f64;
        let expected = n / nbins;

        let mut entropy = 0.0;
        let mut chisq = 0.0;
        let mut weighted = 0.0;
        let mut cmax = 0u64;
        for (i, &bin) in c.bins.iter().enumerate() {
            if bin > 0 {
                let p = bin as f64 / n;
                entropy -= p * p.log2();
                cmax = cmax.max(bin);
            }
            let d = bin as f64 - expected;
            chisq += d * d / expected;
            weighted += i as f64 * bin as f64;
        }
        let mean = weighted / n;

        let (pi, pi_error) = if c.pisamples > 0 {
            let pi = 4.0 * c.inradius as f64 / c.pisamples as f64;
            (pi, (pi - std::f64::consts::PI) / std::f64::consts::PI)
        } else {
            (0.0, 0.0)
        };

        // Circular lag-1 autocorrelation: the final sample wraps to the
        // first one.
        let c1 = c.corr1 as f64 + (c.corrn as f64) * (c.corr0.unwrap_or(0) as f64);
        let c2 = c.corr2 as f64;
        let c3 = c.corr3 as f64;
        let den = n * c3 - c2 * c2;
        let autocorr = if den == 0.0 { 1.0 } else { (n * c1 - c2 * c2) / den };

        // NIST SP 800-90B 9.2 most-common-value estimate.
        let pmax = cmax as f64 / n;
        let upper = ((cmax as f64 + 2.3 * (n * pmax * (1.0 - pmax)).sqrt()) / n).min(1.0);
        let minentropy = if upper > 0.0 { -upper.log2() } else { 0.0 };

        Metrics {
            entropy,
            chisq,
            chisq_p: chisq_pvalue(chisq, c.bins.len() as u64 - 1),
            mean,
            pi,
            pi_error,
            autocorr,
            minentropy,
        }
    }
}

fn needs_normalize(c: &Counters) -> bool {
    c.samples > NORM_LIMIT
        || c.pisamples > NORM_LIMIT
        || c.corr1 > NORM_LIMIT
        || c.corr2 > NORM_LIMIT
        || c.corr3 > NORM_LIMIT
}

/// Halve an accumulator while preserving its chi-squared statistic.
///
/// A plain `bin >>= 1` drags chi-squared toward zero over time because the
/// per-bin error shrinks with the counts; instead each bin keeps its exact
/// chi-squared contribution at the halved scale.
fn normalize(c: &mut Counters) {
    if c.samples == 0 {
        return;
    }
    let nbins = c.bins.len() as f64;
    let old_samples = c.samples as f64;
    let old_expected = old_samples / nbins;
    let new_expected = old_expected / 2.0;

    let mut total = 0u64;
    for bin in &mut c.bins {
        let error = *bin as f64 - old_expected;
        let fudge = (new_expected * error * error / old_expected).sqrt();
        let v = if error < 0.0 {
            new_expected - fudge
        } else {
            new_expected + fudge
        };
        *bin = v.round().max(0.0) as u64;
        total += *bin;
    }

    let ratio = total as f64 / old_samples;
    c.samples = total;
    c.corr1 = (c.corr1 as f64 * ratio) as u64;
    c.corr2 = (c.corr2 as f64 * ratio) as u64;
    c.corr3 = (c.corr3 as f64 * ratio) as u64;
    c.inradius /= 2;
    c.pisamples /= 2;
}
