//! Online repeat-donor detection and running-percentile aggregation.
//!
//! The engine is single-pass: every [`ContributionRecord`] is checked against
//! the [`DonorLedger`] and, when it qualifies as a repeat donation, folded into
//! the [`GroupAggregator`] group for its `(recipient, zip, year)` key. The
//! resulting [`RepeatDonationStats`] are available as soon as the record has
//! been processed.
//!
//! Nothing in this crate performs I/O. Parsing and validation of raw input and
//! formatting of output belong to adapter crates, which hand the engine
//! already-validated records and receive stats through [`StatsSink`].

use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AnalyticsError {
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Which prior sightings make a donor a repeat donor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepeatPolicy {
    /// Any earlier record for the donor qualifies, including one from the
    /// same calendar year.
    #[default]
    AnyPriorSighting,
    /// Only an earlier record dated in a different calendar year qualifies.
    /// Records arriving out of chronological order count in either direction.
    PriorYearOnly,
}

impl RepeatPolicy {
    #[must_use]
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            Self::PriorYearOnly
        } else {
            Self::AnyPriorSighting
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnyPriorSighting => "any_prior_sighting",
            Self::PriorYearOnly => "prior_year_only",
        }
    }
}

/// Identity of a donor: normalized name plus 5-digit ZIP prefix.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DonorId {
    name: String,
    zip: String,
}

impl DonorId {
    #[must_use]
    pub fn new(name: impl Into<String>, zip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zip: zip.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn zip(&self) -> &str {
        &self.zip
    }
}

impl Display for DonorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.zip)
    }
}

/// Aggregation group: recipient, donor ZIP prefix and donation year.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct GroupKey {
    pub recipient: String,
    pub zip: String,
    pub year: i32,
}

impl Display for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.recipient, self.zip, self.year)
    }
}

/// A percentile in `[0, 100]`, held in hundredths of a percent so that rank
/// arithmetic is exact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Percentile {
    hundredths: u32,
}

impl Percentile {
    pub const MAX_HUNDREDTHS: u32 = 10_000;

    /// Builds a percentile from hundredths of a percent (`5_000` is p50).
    ///
    /// # Errors
    /// Returns [`AnalyticsError::Configuration`] when the value exceeds 100%.
    pub fn from_hundredths(hundredths: u32) -> Result<Self, AnalyticsError> {
        if hundredths > Self::MAX_HUNDREDTHS {
            return Err(AnalyticsError::Configuration(format!(
                "percentile MUST be in [0, 100], got {}.{:02}",
                hundredths / 100,
                hundredths % 100
            )));
        }
        Ok(Self { hundredths })
    }

    /// Builds a whole-number percentile.
    ///
    /// # Errors
    /// Returns [`AnalyticsError::Configuration`] when `value > 100`.
    pub fn whole(value: u32) -> Result<Self, AnalyticsError> {
        Self::from_hundredths(value.saturating_mul(100))
    }

    #[must_use]
    pub fn hundredths(self) -> u32 {
        self.hundredths
    }

    /// Nearest-rank position (1-based) for a sequence of `count` elements:
    /// `ceil(p / 100 * count)` clamped to `[1, count]`.
    ///
    /// Returns 0 only when `count` is 0.
    #[must_use]
    pub fn nearest_rank(self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let scaled = u128::from(self.hundredths) * count as u128;
        let rank = scaled.div_ceil(u128::from(Self::MAX_HUNDREDTHS));
        usize::try_from(rank).unwrap_or(count).clamp(1, count)
    }
}

impl Display for Percentile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let whole = self.hundredths / 100;
        match self.hundredths % 100 {
            0 => write!(f, "{whole}"),
            frac if frac % 10 == 0 => write!(f, "{whole}.{}", frac / 10),
            frac => write!(f, "{whole}.{frac:02}"),
        }
    }
}

impl FromStr for Percentile {
    type Err = AnalyticsError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim();
        let invalid = || {
            AnalyticsError::Configuration(format!(
                "percentile MUST be a decimal in [0, 100] with at most two fractional digits, got {value:?}"
            ))
        };

        let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if frac.len() > 2
            || !whole.bytes().all(|byte| byte.is_ascii_digit())
            || !frac.bytes().all(|byte| byte.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: u32 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac: u32 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u32>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };

        let hundredths = whole
            .checked_mul(100)
            .and_then(|value| value.checked_add(frac))
            .ok_or_else(invalid)?;
        Self::from_hundredths(hundredths)
    }
}

impl TryFrom<String> for Percentile {
    type Error = AnalyticsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Percentile> for String {
    fn from(value: Percentile) -> Self {
        value.to_string()
    }
}

/// Per-donor history of the calendar years they contributed in.
#[derive(Debug, Clone, Default)]
pub struct DonorLedger {
    years: HashMap<DonorId, BTreeSet<i32>>,
}

impl DonorLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether `donor` is a repeat donor as of a record dated in
    /// `year`, then records `year` for the donor whatever the verdict.
    ///
    /// The first record ever seen for a donor is never a repeat.
    pub fn is_repeat_and_record(&mut self, donor: &DonorId, year: i32, policy: RepeatPolicy) -> bool {
        let Some(years) = self.years.get_mut(donor) else {
            self.years.insert(donor.clone(), BTreeSet::from([year]));
            return false;
        };

        let repeat = match policy {
            RepeatPolicy::AnyPriorSighting => !years.is_empty(),
            RepeatPolicy::PriorYearOnly => years.iter().any(|seen| *seen != year),
        };
        years.insert(year);
        repeat
    }

    #[must_use]
    pub fn years(&self, donor: &DonorId) -> Option<&BTreeSet<i32>> {
        self.years.get(donor)
    }

    #[must_use]
    pub fn donor_count(&self) -> usize {
        self.years.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }
}

/// Amounts received by one aggregation group, kept in ascending order.
///
/// The total is widened to `u128` so that no sequence of `u64` amounts can
/// overflow it.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct GroupState {
    amounts: Vec<u64>,
    total: u128,
}

impl GroupState {
    fn insert(&mut self, amount: u64) {
        // Input is mostly chronological, so the slot is usually at or near the tail.
        let slot = self
            .amounts
            .iter()
            .rposition(|existing| *existing <= amount)
            .map_or(0, |index| index + 1);
        self.amounts.insert(slot, amount);
        self.total += u128::from(amount);
    }

    #[must_use]
    pub fn amounts(&self) -> &[u64] {
        &self.amounts
    }

    #[must_use]
    pub fn total(&self) -> u128 {
        self.total
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.amounts.len()
    }

    /// Nearest-rank percentile of the amounts seen so far; `None` when empty.
    #[must_use]
    pub fn percentile(&self, percentile: Percentile) -> Option<u64> {
        let rank = percentile.nearest_rank(self.amounts.len());
        self.amounts.get(rank.checked_sub(1)?).copied()
    }
}

/// Running statistics for a group immediately after an insertion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunningStats {
    pub percentile_amount: u64,
    pub total: u128,
    pub count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GroupAggregator {
    groups: HashMap<GroupKey, GroupState>,
}

impl GroupAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to the group for `key` and reports the group's
    /// percentile, running total and running count including that amount.
    pub fn insert_and_report(
        &mut self,
        key: GroupKey,
        amount: u64,
        percentile: Percentile,
    ) -> RunningStats {
        let state = self.groups.entry(key).or_default();
        state.insert(amount);

        let rank = percentile.nearest_rank(state.count());
        RunningStats {
            percentile_amount: state.amounts[rank - 1],
            total: state.total,
            count: state.count(),
        }
    }

    #[must_use]
    pub fn group(&self, key: &GroupKey) -> Option<&GroupState> {
        self.groups.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// A validated contribution, amounts in cents.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContributionRecord {
    pub recipient: String,
    pub donor: DonorId,
    pub year: i32,
    pub amount_cents: u64,
}

impl ContributionRecord {
    #[must_use]
    pub fn new(
        recipient: impl Into<String>,
        donor_name: impl Into<String>,
        zip: impl Into<String>,
        year: i32,
        amount_cents: u64,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            donor: DonorId::new(donor_name, zip),
            year,
            amount_cents,
        }
    }

    #[must_use]
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            recipient: self.recipient.clone(),
            zip: self.donor.zip().to_string(),
            year: self.year,
        }
    }
}

/// One output row, emitted for every repeat donation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepeatDonationStats {
    pub recipient: String,
    pub zip: String,
    pub year: i32,
    pub percentile_amount: u64,
    pub total_amount: u128,
    pub count: usize,
}

impl RepeatDonationStats {
    #[must_use]
    pub fn new(key: GroupKey, stats: RunningStats) -> Self {
        Self {
            recipient: key.recipient,
            zip: key.zip,
            year: key.year,
            percentile_amount: stats.percentile_amount,
            total_amount: stats.total,
            count: stats.count,
        }
    }
}

/// Receives stats rows as they are produced.
pub trait StatsSink {
    type Error;

    /// Accepts one stats row.
    ///
    /// # Errors
    /// Implementation-defined; writer-backed sinks surface I/O failures.
    fn emit(&mut self, stats: &RepeatDonationStats) -> Result<(), Self::Error>;
}

impl StatsSink for Vec<RepeatDonationStats> {
    type Error = Infallible;

    fn emit(&mut self, stats: &RepeatDonationStats) -> Result<(), Self::Error> {
        self.push(stats.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProcessorConfig {
    pub percentile: Percentile,
    pub policy: RepeatPolicy,
}

/// Runs one record through the ledger and, for repeat donations, the
/// aggregator. The ledger is always consulted first.
pub fn process_contribution(
    ledger: &mut DonorLedger,
    groups: &mut GroupAggregator,
    config: &ProcessorConfig,
    record: &ContributionRecord,
) -> Option<RepeatDonationStats> {
    if !ledger.is_repeat_and_record(&record.donor, record.year, config.policy) {
        tracing::trace!(donor = %record.donor, year = record.year, "first qualifying sighting");
        return None;
    }

    let key = record.group_key();
    let stats = groups.insert_and_report(key.clone(), record.amount_cents, config.percentile);
    tracing::trace!(group = %key, count = stats.count, "repeat donation aggregated");
    Some(RepeatDonationStats::new(key, stats))
}

/// Owns the ledger and aggregator for a single run.
#[derive(Debug, Clone)]
pub struct StreamProcessor {
    config: ProcessorConfig,
    ledger: DonorLedger,
    groups: GroupAggregator,
}

impl StreamProcessor {
    #[must_use]
    pub fn new(config: ProcessorConfig) -> Self {
        Self::with_state(config, DonorLedger::new(), GroupAggregator::new())
    }

    #[must_use]
    pub fn with_state(config: ProcessorConfig, ledger: DonorLedger, groups: GroupAggregator) -> Self {
        Self {
            config,
            ledger,
            groups,
        }
    }

    pub fn process(&mut self, record: &ContributionRecord) -> Option<RepeatDonationStats> {
        process_contribution(&mut self.ledger, &mut self.groups, &self.config, record)
    }

    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    #[must_use]
    pub fn ledger(&self) -> &DonorLedger {
        &self.ledger
    }

    #[must_use]
    pub fn groups(&self) -> &GroupAggregator {
        &self.groups
    }
}
