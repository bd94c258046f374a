//! FIPS 140-2 continuous tests with NIST SP 800-90B additions.
//!
//! Six sub-tests run over 20000-bit blocks: Monobit, Poker, Runs, LongRun,
//! the 800-90B repetition-count variant on 32-bit words, and the 800-90B
//! adaptive-proportion test. The adaptive-proportion window and the
//! repetition carry word persist across blocks; everything else is
//! per-block.
//!
//! Beyond the raw pass/fail verdicts the suite keeps a Q20 fixed-point
//! failure-rate EMA and pass-run statistics per sub-test, and derives a
//! hysteretic ok-state from them: a healthy channel trips on a single
//! failed block (the EMA bump crosses the rate ceiling) and recovers only
//! after the rate decays below half the ceiling with a sustained run of
//! passing blocks.

use serde::{Deserialize, Serialize};

/// Bytes per FIPS block (20000 bits).
pub const FIPS_BLOCK_BYTES: usize = 2500;

/// Q20 fixed-point one.
const Q20_ONE: u64 = 1 << 20;
/// EMA period in blocks.
const EMA_PERIOD: u64 = 1000;
/// Renormalise pass/fail counters at this mark.
const COUNT_LIMIT: u64 = u64::MAX / 2;

/// Adaptive-proportion window length in samples (H = 8).
const AP_WINDOW: u32 = 65_536;
/// Adaptive-proportion cutoff: additional repeats of the window's first
/// sample (alpha = 2^-30).
const AP_CUTOFF: u32 = 358;

/// A run of this many identical bits fails LongRun.
const LONG_RUN_LIMIT: u64 = 26;

/// Inclusive per-block bounds on runs of length 1..=5 and 6+.
const RUN_BOUNDS: [(u64, u64); 6] = [
    (2315, 2685),
    (1114, 1386),
    (527, 723),
    (240, 384),
    (103, 209),
    (103, 209),
];

/// Sub-test indices; `RESULT` is the composite verdict.
pub const MONOBIT: usize = 0;
pub const POKER: usize = 1;
pub const RUNS: usize = 2;
pub const LONG_RUN: usize = 3;
pub const REPETITION: usize = 4;
pub const PROPORTION: usize = 5;
pub const RESULT: usize = 6;
pub const NTESTS: usize = 7;

pub const TEST_NAMES: [&str; NTESTS] = [
    "Monobit",
    "Poker",
    "Runs",
    "LongRun",
    "Repetition",
    "Proportion",
    "Result",
];

/// Per-sub-test running statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStat {
    #[serde(rename = "Pass")]
    pub pass: u64,
    #[serde(rename = "Fail")]
    pub fail: u64,
    /// Failure-rate EMA, Q20 fixed point over ~1000 blocks.
    #[serde(rename = "FailRate")]
    pub rate_q20: u64,
    /// Length of the current run of consecutive passes.
    #[serde(rename = "PassRun")]
    pub run_cur: u64,
    /// Length of the most recently completed pass run.
    #[serde(rename = "PassRunLast")]
    pub run_last: u64,
    /// Longest pass run seen.
    #[serde(rename = "PassRunMax")]
    pub run_max: u64,
}

impl TestStat {
    fn update(&mut self, passed: bool) {
        if self.pass + self.fail >= COUNT_LIMIT {
            self.pass /= 2;
            self.fail /= 2;
        }
        // Ceiling division so the decay reaches zero instead of stalling
        // one period above it.
        self.rate_q20 -= self.rate_q20.div_ceil(EMA_PERIOD).min(self.rate_q20);
        if passed {
            self.pass += 1;
            self.run_cur += 1;
            self.run_max = self.run_max.max(self.run_cur);
        } else {
            self.fail += 1;
            self.rate_q20 += Q20_ONE / EMA_PERIOD;
            self.run_last = self.run_cur;
            self.run_cur = 0;
        }
    }
}

/// Hysteresis ceilings, indexed like the sub-tests.
///
/// `max_pass_run` caps how long a sub-test may go *without* failing: a
/// healthy source is expected to trip each test occasionally, so a
/// too-perfect record is itself an anomaly. `max_rate_q20` caps the failure
/// EMA; the defaults sit below a single block's EMA bump (`Q20/1000`), so
/// one failed block flips the channel to not-ok. All values are empirical
/// tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FipsLimits {
    pub max_rate_q20: [u64; NTESTS],
    pub max_pass_run: [u64; NTESTS],
    /// Consecutive passing blocks needed before a not-ok channel may
    /// recover.
    pub recover_blocks: u64,
}

impl Default for FipsLimits {
    fn default() -> Self {
        Self {
            max_rate_q20: [1000, 1000, 1000, 1000, 600, 600, 2000],
            max_pass_run: [
                134_500,
                141_200,
                42_500,
                46_900,
                96_000_000,
                u64::MAX,
                17_500,
            ],
            recover_blocks: 20,
        }
    }
}

/// Verdicts for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockResult {
    pub monobit: bool,
    pub poker: bool,
    pub runs: bool,
    pub long_run: bool,
    pub repetition: bool,
    pub proportion: bool,
    /// Composite: fails iff any sub-test fails.
    pub result: bool,
}

/// FIPS 140-2 continuous test state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fips {
    #[serde(rename = "Tests")]
    stats: [TestStat; NTESTS],
    #[serde(rename = "Blocks")]
    blocks: u64,
    #[serde(rename = "Ok")]
    ok: bool,
    /// Adaptive-proportion window: first sample, additional repeats seen,
    /// samples consumed (0 means no window is open).
    #[serde(rename = "ApValue")]
    ap_value: u8,
    #[serde(rename = "ApSeen")]
    ap_seen: u32,
    #[serde(rename = "ApPos")]
    ap_pos: u32,
    /// Last 32-bit word of the previous block, for the repetition carry.
    #[serde(rename = "PrevWord")]
    prev_word: Option<u32>,
    #[serde(rename = "Limits")]
    limits: FipsLimits,
}

impl Default for Fips {
    fn default() -> Self {
        Self::new()
    }
}

impl Fips {
    pub fn new() -> Self {
        Self::with_limits(FipsLimits::default())
    }

    pub fn with_limits(limits: FipsLimits) -> Self {
        Self {
            stats: [TestStat::default(); NTESTS],
            blocks: 0,
            ok: false,
            ap_value: 0,
            ap_seen: 0,
            ap_pos: 0,
            prev_word: None,
            limits,
        }
    }

    /// Hysteretic channel verdict.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn stats(&self) -> &[TestStat; NTESTS] {
        &self.stats
    }

    pub fn limits(&self) -> &FipsLimits {
        &self.limits
    }

    /// Run all six sub-tests over one 20000-bit block and update the
    /// running statistics and ok-state.
    pub fn check_block(&mut self, block: &[u8; FIPS_BLOCK_BYTES]) -> BlockResult {
        let mut ones = 0u32;
        let mut poker = [0u64; 16];
        let mut runs = [[0u64; 6]; 2];
        let mut longest = 0u64;
        let mut cur_bit = 2u8;
        let mut cur_len = 0u64;
        let mut proportion = true;

        for &byte in block.iter() {
            ones += byte.count_ones();
            poker[(byte >> 4) as usize] += 1;
            poker[(byte & 0x0F) as usize] += 1;

            for shift in (0..8).rev() {
                let bit = (byte >> shift) & 1;
                if bit == cur_bit {
                    cur_len += 1;
                } else {
                    if cur_len > 0 {
                        runs[cur_bit as usize][(cur_len.min(6) - 1) as usize] += 1;
                        longest = longest.max(cur_len);
                    }
                    cur_bit = bit;
                    cur_len = 1;
                }
            }

            if !self.proportion_step(byte) {
                proportion = false;
            }
        }
        runs[cur_bit as usize][(cur_len.min(6) - 1) as usize] += 1;
        longest = longest.max(cur_len);

        let monobit = ones > 9725 && ones < 10275;

        let poker_sum: u64 = poker.iter().map(|&f| f * f).sum();
        let poker = poker_sum > 1_563_175 && poker_sum <= 1_576_928;

        let mut runs_ok = true;
        for bit_runs in &runs {
            for (cell, &(lo, hi)) in bit_runs.iter().zip(RUN_BOUNDS.iter()) {
                if *cell < lo || *cell > hi {
                    runs_ok = false;
                }
            }
        }

        let long_run = longest < LONG_RUN_LIMIT;

        let mut repetition = true;
        for word in block.chunks_exact(4) {
            let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            if self.prev_word == Some(w) {
                repetition = false;
            }
            self.prev_word = Some(w);
        }

        let result = BlockResult {
            monobit,
            poker,
            runs: runs_ok,
            long_run,
            repetition,
            proportion,
            result: monobit && poker && runs_ok && long_run && repetition && proportion,
        };

        self.stats[MONOBIT].update(result.monobit);
        self.stats[POKER].update(result.poker);
        self.stats[RUNS].update(result.runs);
        self.stats[LONG_RUN].update(result.long_run);
        self.stats[REPETITION].update(result.repetition);
        self.stats[PROPORTION].update(result.proportion);
        self.stats[RESULT].update(result.result);
        self.blocks += 1;
        self.update_ok();
        result
    }

    /// One adaptive-proportion sample. Returns false when the window's
    /// first value reached the cutoff; the window restarts either way.
    fn proportion_step(&mut self, b: u8) -> bool {
        if self.ap_pos == 0 {
            self.ap_value = b;
            self.ap_seen = 0;
            self.ap_pos = 1;
            return true;
        }
        self.ap_pos += 1;
        if b == self.ap_value {
            self.ap_seen += 1;
            if self.ap_seen >= AP_CUTOFF {
                self.ap_pos = 0;
                return false;
            }
        }
        if self.ap_pos >= AP_WINDOW {
            self.ap_pos = 0;
        }
        true
    }

    fn update_ok(&mut self) {
        let lim = &self.limits;
        let mut good = true;
        for t in 0..NTESTS {
            let s = &self.stats[t];
            if s.rate_q20 >= lim.max_rate_q20[t] || s.run_cur >= lim.max_pass_run[t] {
                good = false;
            }
        }

        if self.ok {
            self.ok = good;
        } else {
            let mut recovered = good && self.stats[RESULT].run_cur >= lim.recover_blocks;
            for t in 0..NTESTS {
                let s = &self.stats[t];
                if s.rate_q20 >= lim.max_rate_q20[t] / 2
                    || s.run_last >= lim.max_pass_run[t] / 2
                {
                    recovered = false;
                }
            }
            self.ok = recovered;
        }
    }
}
