//! Statistics
//!
//! Three kinds of statistic: SAMPLE (mean of observations), VARIABLE
//! (time-weighted mean of a piecewise constant value) and RATE (events
//! per unit time). Kernel utilization stats are ordinary VARIABLE stats.
//!
//! Design:
//! - Sums use Kahan compensation, so long runs of tiny increments do not vanish
//! - Reports are built as strings; the caller decides where they go
//! - Block statistics accumulate per-batch means and their squares for
//!   Student-t confidence intervals

use serde::{Deserialize, Serialize};

use super::calendar::EventKind;
use super::error::SyscallResult;
use super::Kernel;

/// Index of a statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatId(pub usize);

impl std::fmt::Display for StatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatKind {
    Sample,
    Variable,
    Rate,
}

impl StatKind {
    pub fn label(self) -> &'static str {
        match self {
            StatKind::Sample => "SAMPLE",
            StatKind::Variable => "VAR",
            StatKind::Rate => "RATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StatValues {
    Sample {
        count: u64,
        sum: f64,
        resid: f64,
    },
    Variable {
        start: f64,
        old_time: f64,
        old_value: f64,
        integral: f64,
        resid: f64,
    },
    Rate {
        start: f64,
        count: u64,
    },
}

/// Adds `delta` into `sum` with Kahan compensation
fn kahan_add(sum: &mut f64, resid: &mut f64, delta: f64) {
    let y = delta - *resid;
    let t = *sum + y;
    *resid = (t - *sum) - y;
    *sum = t;
}

#[derive(Debug, Clone)]
pub(crate) struct Stat {
    pub name: String,
    pub values: StatValues,
}

impl Stat {
    pub fn new(name: String, kind: StatKind, now: f64) -> Self {
        let values = match kind {
            StatKind::Sample => StatValues::Sample {
                count: 0,
                sum: 0.0,
                resid: 0.0,
            },
            StatKind::Variable => StatValues::Variable {
                start: now,
                old_time: now,
                old_value: 0.0,
                integral: 0.0,
                resid: 0.0,
            },
            StatKind::Rate => StatValues::Rate {
                start: now,
                count: 0,
            },
        };
        Self { name, values }
    }

    pub fn kind(&self) -> StatKind {
        match self.values {
            StatValues::Sample { .. } => StatKind::Sample,
            StatValues::Variable { .. } => StatKind::Variable,
            StatValues::Rate { .. } => StatKind::Rate,
        }
    }

    /// Record a sample, or a new value of a variable as of `at`
    pub fn record(&mut self, value: f64, at: f64) -> bool {
        match &mut self.values {
            StatValues::Sample { count, sum, resid } => {
                *count += 1;
                kahan_add(sum, resid, value);
                true
            }
            StatValues::Variable {
                old_time,
                old_value,
                integral,
                resid,
                ..
            } => {
                let dt = at - *old_time;
                if dt != 0.0 {
                    kahan_add(integral, resid, dt * *old_value);
                    *old_time = at;
                }
                *old_value = value;
                true
            }
            StatValues::Rate { .. } => false,
        }
    }

    /// Count one occurrence of a RATE stat
    pub fn record_rate(&mut self) -> bool {
        match &mut self.values {
            StatValues::Rate { count, .. } => {
                *count += 1;
                true
            }
            _ => false,
        }
    }

    /// Add into the sum of a SAMPLE stat without counting an observation
    pub fn add(&mut self, value: f64) -> bool {
        match &mut self.values {
            StatValues::Sample { sum, resid, .. } => {
                kahan_add(sum, resid, value);
                true
            }
            _ => false,
        }
    }

    /// Mean and observation measure (count, or interval for VARIABLE)
    pub fn observe(&self, now: f64) -> (f64, f64) {
        match self.values {
            StatValues::Sample { count, sum, .. } => {
                let mean = if count > 0 { sum / count as f64 } else { 0.0 };
                (mean, count as f64)
            }
            StatValues::Variable {
                start,
                old_time,
                old_value,
                integral,
                ..
            } => {
                let obs = now - start;
                if obs > 0.0 {
                    let total = integral + (now - old_time) * old_value;
                    (total / obs, obs)
                } else {
                    (0.0, 0.0)
                }
            }
            StatValues::Rate { start, count } => {
                let obs = now - start;
                let mean = if obs != 0.0 { count as f64 / obs } else { 0.0 };
                (mean, count as f64)
            }
        }
    }

    /// Discard accumulated observations as of `now`
    pub fn reset(&mut self, now: f64) {
        match &mut self.values {
            StatValues::Sample { count, sum, resid } => {
                *count = 0;
                *sum = 0.0;
                *resid = 0.0;
            }
            StatValues::Variable {
                start,
                old_time,
                integral,
                resid,
                ..
            } => {
                *start = now;
                *old_time = now;
                *integral = 0.0;
                *resid = 0.0;
            }
            StatValues::Rate { start, count } => {
                *start = now;
                *count = 0;
            }
        }
    }

    fn report_row(&self, now: f64) -> String {
        let (mean, obs) = self.observe(now);
        let obs = match self.kind() {
            StatKind::Variable => format_g(obs, 6, true),
            _ => format!("{}", obs as u64),
        };
        format!(
            "{:<38.38}\t{}\t{:>8}\t{}\n",
            self.name,
            self.kind().label(),
            format_g(mean, 6, true),
            obs
        )
    }
}

/// One row of a serializable statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatEntry {
    pub name: String,
    pub kind: StatKind,
    pub mean: f64,
    pub observations: f64,
}

/// Snapshot of every statistic, sorted by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub time: f64,
    pub stats: Vec<StatEntry>,
}

impl StatsReport {
    pub(crate) fn collect(stats: &[Stat], now: f64) -> Self {
        let mut entries: Vec<StatEntry> = stats
            .iter()
            .map(|stat| {
                let (mean, observations) = stat.observe(now);
                StatEntry {
                    name: stat.name.clone(),
                    kind: stat.kind(),
                    mean,
                    observations,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            time: now,
            stats: entries,
        }
    }

    pub fn get(&self, name: &str) -> Option<&StatEntry> {
        self.stats.iter().find(|entry| entry.name == name)
    }
}

/// Text report of every statistic, sorted by name
pub(crate) fn render_report(stats: &[Stat], now: f64) -> String {
    let mut sorted: Vec<&Stat> = stats.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = format!(
        "\n\nSimulation statistics for time = {}.\n",
        format_g(now, 6, true)
    );
    out.push_str("\n Name\t\t\t\t\tType\t  Mean\tObs(#|interval)\n\n");
    for stat in sorted {
        out.push_str(&stat.report_row(now));
    }
    out
}

// ============================================================================
// Block statistics
// ============================================================================

/// Student t values for 95% and 99% two-sided intervals, by degrees of
/// freedom 1..=30, then 40, 60, 120 and infinity
const T_TAB: [[f64; 34]; 2] = [
    [
        12.706, 4.303, 3.182, 2.776, 2.571, 2.447, 2.365, 2.306, 2.262, 2.228, 2.201, 2.179,
        2.160, 2.145, 2.131, 2.120, 2.110, 2.101, 2.093, 2.086, 2.080, 2.074, 2.069, 2.064,
        2.060, 2.056, 2.052, 2.048, 2.045, 2.042, 2.021, 2.000, 1.980, 1.960,
    ],
    [
        63.657, 9.925, 5.841, 4.604, 4.032, 3.707, 3.499, 3.355, 3.250, 3.169, 3.106, 3.055,
        3.012, 2.977, 2.947, 2.921, 2.898, 2.878, 2.861, 2.845, 2.831, 2.819, 2.807, 2.797,
        2.787, 2.779, 2.771, 2.763, 2.756, 2.750, 2.704, 2.660, 2.617, 2.576,
    ],
];

/// t values (95%, 99%) for `nb` batches
pub(crate) fn t_values(nb: usize) -> (f64, f64) {
    let ti = nb.saturating_sub(2);
    let lerp = |row: usize, lo: usize, span: f64, base: usize| {
        T_TAB[row][lo] + (T_TAB[row][lo + 1] - T_TAB[row][lo]) * (ti - base) as f64 / span
    };
    if ti < 30 {
        (T_TAB[0][ti], T_TAB[1][ti])
    } else if ti < 40 {
        (lerp(0, 29, 10.0, 29), lerp(1, 29, 10.0, 29))
    } else if ti < 60 {
        (lerp(0, 30, 20.0, 39), lerp(1, 30, 20.0, 39))
    } else if ti < 120 {
        (lerp(0, 31, 60.0, 59), lerp(1, 31, 60.0, 59))
    } else {
        (T_TAB[0][33], T_TAB[1][33])
    }
}

/// Batch-means collection state
#[derive(Debug, Clone)]
pub(crate) struct BlockStats {
    pub nb: usize,
    /// Batches finished so far
    pub done: usize,
    /// Length of one batch
    pub period: f64,
    /// Warm-up has ended and batches are running
    pub started: bool,
    pub sum: Vec<f64>,
    pub sumsq: Vec<f64>,
}

impl BlockStats {
    pub fn new(nb: usize, period: f64) -> Self {
        Self {
            nb,
            done: 0,
            period,
            started: false,
            sum: Vec::new(),
            sumsq: Vec::new(),
        }
    }

    /// Fold the current batch into the sums and reset every stat
    pub fn close_batch(&mut self, stats: &mut [Stat], now: f64) {
        if self.sum.len() < stats.len() {
            self.sum.resize(stats.len(), 0.0);
            self.sumsq.resize(stats.len(), 0.0);
        }
        for (i, stat) in stats.iter_mut().enumerate() {
            let (mean, _) = stat.observe(now);
            self.sum[i] += mean;
            self.sumsq[i] += mean * mean;
            stat.reset(now);
        }
        self.done += 1;
    }

    pub fn is_complete(&self) -> bool {
        self.done >= self.nb
    }

    /// Batch means with interval half-widths, in stat order
    pub fn render(&self, stats: &[Stat], run_time: f64) -> String {
        let (t1, t2) = t_values(self.nb);
        let nb = self.nb as f64;
        let mut out = format!(
            "\n\nBlocked simulation statistics for time = {}.\n",
            format_g(run_time, 6, true)
        );
        out.push_str("\n Name\t\t\t\t\t  Mean\t\t95% Interval\t99% Interval\n\n");
        for (i, stat) in stats.iter().enumerate() {
            let s = self.sum.get(i).copied().unwrap_or(0.0);
            let ss = self.sumsq.get(i).copied().unwrap_or(0.0);
            let mean = s / nb;
            let sd = ((ss - s * s / nb) / (nb * (nb - 1.0))).abs().sqrt();
            out.push_str(&format!(
                "{:<38.38}\t{:>8}\t{:>8}\t{:>8}\n",
                stat.name,
                format_g(mean, 6, true),
                format_g(t1 * sd, 6, true),
                format_g(t2 * sd, 6, true)
            ));
        }
        out.push_str("\n\n");
        out
    }
}

// ============================================================================
// Kernel calls
// ============================================================================

impl Kernel {
    fn stat_mut(&mut self, call: &'static str, sid: StatId) -> SyscallResult<&mut Stat> {
        if sid.0 >= self.stats.len() {
            return Err(self.bad_param(call, "stat"));
        }
        Ok(&mut self.stats[sid.0])
    }

    pub(crate) fn open_stat(&mut self, name: &str, kind: StatKind) -> SyscallResult<StatId> {
        if self.block_stats.as_ref().is_some_and(|bs| bs.started) {
            return Err(self.bad_call("open_stat", "Doesn't work once block stats is in effect"));
        }
        Ok(self.open_internal_stat(name.to_string(), kind, self.now))
    }

    /// A SAMPLE observation, or the new value of a VARIABLE
    pub(crate) fn record_stat(&mut self, sid: StatId, value: f64) -> SyscallResult<()> {
        let now = self.now;
        self.record_stat2(sid, value, now)
    }

    /// As `record_stat`, with the VARIABLE change taking effect at `start`
    pub(crate) fn record_stat2(&mut self, sid: StatId, value: f64, start: f64) -> SyscallResult<()> {
        if self.stat_mut("record_stat", sid)?.record(value, start) {
            return Ok(());
        }
        Err(self.bad_call("record_stat", "Only works for VARIABLE and SAMPLE statistics"))
    }

    pub(crate) fn record_rate_stat(&mut self, sid: StatId) -> SyscallResult<()> {
        if self.stat_mut("record_rate_stat", sid)?.record_rate() {
            return Ok(());
        }
        Err(self.bad_call("record_rate_stat", "Only works for RATE statistics"))
    }

    /// Add to a SAMPLE sum without counting an observation
    pub(crate) fn add_stat(&mut self, sid: StatId, value: f64) -> SyscallResult<()> {
        if self.stat_mut("add_stat", sid)?.add(value) {
            return Ok(());
        }
        Err(self.bad_call("add_stat", "Only works for SAMPLE statistics"))
    }

    /// Mean and observation measure: the count for SAMPLE and RATE, the
    /// observed interval for VARIABLE
    pub fn get_stat(&self, sid: StatId) -> SyscallResult<(f64, f64)> {
        match self.stats.get(sid.0) {
            Some(stat) => Ok(stat.observe(self.now)),
            None => Err(self.bad_param("get_stat", "stat")),
        }
    }

    pub(crate) fn reset_stat(&mut self, sid: StatId) -> SyscallResult<()> {
        let now = self.now;
        self.stat_mut("reset_stat", sid)?.reset(now);
        Ok(())
    }

    pub(crate) fn reset_all_stats(&mut self) {
        let now = self.now;
        for stat in &mut self.stats {
            stat.reset(now);
        }
    }

    /// Collect `nb` batch means over what is left of the run after a
    /// warm-up of `delay`
    pub(crate) fn block_stats(&mut self, nb: usize, delay: f64) -> SyscallResult<()> {
        if self.block_stats.is_some() {
            return Err(self.bad_call("block_stats", "block_stats has already been called"));
        }
        if nb < 2 {
            return Err(self.bad_param("block_stats", "nb"));
        }
        if delay < 0.0 || delay > self.run_time - self.now {
            return Err(self.bad_param("block_stats", "delay"));
        }
        let period = (self.run_time - self.now - delay) / nb as f64;
        self.block_stats = Some(BlockStats::new(nb, period));
        self.add_event(self.now + delay, EventKind::StatBlock);
        Ok(())
    }

    /// STAT_BLOCK: the warm-up or a batch is over
    pub(crate) fn stat_block(&mut self) {
        let now = self.now;
        let Some(bs) = self.block_stats.as_mut() else {
            return;
        };
        if bs.started {
            bs.close_batch(&mut self.stats, now);
        } else {
            bs.started = true;
            for stat in &mut self.stats {
                stat.reset(now);
            }
        }

        if bs.is_complete() {
            let report = bs.render(&self.stats, self.run_time);
            tracing::info!(target: "parasol::stats", "{report}");
            self.block_report = Some(report);
            return;
        }
        // The last batch ends with the run
        let due = if bs.done + 1 == bs.nb {
            self.run_time
        } else {
            now + bs.period
        };
        self.add_event(due, EventKind::StatBlock);
    }

    pub fn stats_report(&self) -> StatsReport {
        StatsReport::collect(&self.stats, self.now)
    }

    pub fn render_stats(&self) -> String {
        render_report(&self.stats, self.now)
    }

    pub fn block_report(&self) -> Option<&str> {
        self.block_report.as_deref()
    }

    pub fn stat_name(&self, sid: StatId) -> Option<&str> {
        self.stats.get(sid.0).map(|stat| stat.name.as_str())
    }

    /// Look a statistic up by name
    pub fn find_stat(&self, name: &str) -> Option<StatId> {
        self.stats.iter().position(|stat| stat.name == name).map(StatId)
    }
}

// ============================================================================
// Number formatting
// ============================================================================

/// `%g`-style formatting with `precision` significant digits
pub fn format_g(value: f64, precision: usize, upper: bool) -> String {
    if value.is_nan() {
        return if upper { "NAN" } else { "nan" }.to_string();
    }
    if value.is_infinite() {
        let s = if value < 0.0 { "-inf" } else { "inf" };
        return if upper { s.to_uppercase() } else { s.to_string() };
    }
    let p = precision.max(1);
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let sci = format!("{:.*e}", p - 1, value);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);

    if exp < -4 || exp >= p as i32 {
        let e = if upper { 'E' } else { 'e' };
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}{e}{sign}{:02}", strip_zeros(mantissa), exp.abs())
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        strip_zeros(&format!("{value:.decimals$}")).to_string()
    }
}

fn strip_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
