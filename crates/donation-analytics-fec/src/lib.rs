//! FEC individual-contribution adapter for the donation analytics engine.
//!
//! Turns pipe-delimited FEC records into validated [`ContributionRecord`]s,
//! drives them through a [`StreamProcessor`] and writes repeat-donation rows
//! as `recipient|zip|year|percentile|total|count`.

use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use csv::StringRecord;
use donation_analytics_core::{
    ContributionRecord, Percentile, RepeatDonationStats, StatsSink, StreamProcessor,
};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::Date;
use tracing::{debug, info};

pub const RECIPIENT_COLUMN: &str = "CMTE_ID";
pub const NAME_COLUMN: &str = "NAME";
pub const ZIP_COLUMN: &str = "ZIP_CODE";
pub const DATE_COLUMN: &str = "TRANSACTION_DT";
pub const AMOUNT_COLUMN: &str = "TRANSACTION_AMT";
pub const OTHER_ID_COLUMN: &str = "OTHER_ID";

const ZIP_PREFIX_LEN: usize = 5;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LayoutError {
    #[error("header line is empty")]
    EmptyHeader,
    #[error("column {column} does not exist in the header; available columns: {available}")]
    MissingColumn { column: String, available: String },
}

/// Why an input line was skipped.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RecordRejection {
    #[error("it is a blank line")]
    Blank,
    #[error("it is not valid UTF-8")]
    NotUtf8,
    #[error("it has {found} fields, expected {expected}")]
    FieldCount { expected: usize, found: usize },
    #[error("OTHER_ID field is not empty: {0}")]
    OtherIdPresent(String),
    #[error("CMTE_ID field is missing, empty or not alphanumeric")]
    InvalidRecipient,
    #[error("NAME field is blank")]
    BlankName,
    #[error("ZIP_CODE field is missing, empty or malformed: {0:?}")]
    MalformedZip(String),
    #[error("TRANSACTION_DT field is empty")]
    MissingDate,
    #[error("TRANSACTION_DT field is malformed: {0:?}")]
    MalformedDate(String),
    #[error("TRANSACTION_AMT field is malformed: {0:?}")]
    MalformedAmount(String),
    #[error("TRANSACTION_AMT field is not positive: {0:?}")]
    NonPositiveAmount(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LineOutcome {
    Comment,
    Rejected(RecordRejection),
    Valid(ContributionRecord),
}

/// Positions of the fields the engine needs within a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnLayout {
    pub recipient: usize,
    pub name: usize,
    pub zip: usize,
    pub date: usize,
    pub amount: usize,
    pub other_id: usize,
    pub width: usize,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self::fec_individual()
    }
}

impl ColumnLayout {
    /// Layout of the FEC "contributions by individuals" bulk file.
    #[must_use]
    pub fn fec_individual() -> Self {
        Self {
            recipient: 0,
            name: 7,
            zip: 10,
            date: 13,
            amount: 14,
            other_id: 15,
            width: 21,
        }
    }

    /// Locates the required columns in a comma-separated header line such as
    /// the FEC `indiv_header_file.csv`.
    ///
    /// # Errors
    /// Returns [`LayoutError`] when the header is empty or lacks one of the
    /// required columns.
    pub fn from_header(line: &str) -> Result<Self, LayoutError> {
        let columns: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if columns.iter().all(|column| column.is_empty()) {
            return Err(LayoutError::EmptyHeader);
        }

        let position = |wanted: &str| {
            columns
                .iter()
                .position(|column| *column == wanted)
                .ok_or_else(|| LayoutError::MissingColumn {
                    column: wanted.to_string(),
                    available: columns.join(","),
                })
        };

        Ok(Self {
            recipient: position(RECIPIENT_COLUMN)?,
            name: position(NAME_COLUMN)?,
            zip: position(ZIP_COLUMN)?,
            date: position(DATE_COLUMN)?,
            amount: position(AMOUNT_COLUMN)?,
            other_id: position(OTHER_ID_COLUMN)?,
            width: columns.len(),
        })
    }

    /// Reads the first line of a header file and builds the layout from it.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or its header is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading header file {}", path.display()))?;
        let header = body.lines().next().unwrap_or_default();
        Self::from_header(header)
            .with_context(|| format!("invalid header file {}", path.display()))
    }

    /// Classifies one record. Checks run in a fixed order and the first
    /// failing check names the rejection.
    #[must_use]
    pub fn classify(&self, record: &StringRecord) -> LineOutcome {
        let first = record.get(0).unwrap_or_default();
        if record.len() <= 1 && first.trim().is_empty() {
            return LineOutcome::Rejected(RecordRejection::Blank);
        }
        if first.starts_with('#') {
            return LineOutcome::Comment;
        }
        if record.len() != self.width {
            return LineOutcome::Rejected(RecordRejection::FieldCount {
                expected: self.width,
                found: record.len(),
            });
        }

        match self.validate(record) {
            Ok(valid) => LineOutcome::Valid(valid),
            Err(rejection) => LineOutcome::Rejected(rejection),
        }
    }

    fn validate(&self, record: &StringRecord) -> Result<ContributionRecord, RecordRejection> {
        let field = |index: usize| record.get(index).unwrap_or_default();

        let other_id = field(self.other_id);
        if !other_id.trim().is_empty() {
            return Err(RecordRejection::OtherIdPresent(other_id.to_string()));
        }

        let recipient = field(self.recipient);
        if recipient.is_empty() || !recipient.chars().all(char::is_alphanumeric) {
            return Err(RecordRejection::InvalidRecipient);
        }

        let name = normalize_name(field(self.name));
        if name.is_empty() {
            return Err(RecordRejection::BlankName);
        }

        let zip = zip_prefix(field(self.zip))?;

        let raw_date = field(self.date);
        if raw_date.trim().is_empty() {
            return Err(RecordRejection::MissingDate);
        }

        let amount_cents = parse_cents(field(self.amount))?;
        let year = parse_year(raw_date)?;

        Ok(ContributionRecord::new(recipient, name, zip, year, amount_cents))
    }
}

/// Trims, collapses runs of whitespace and upper-cases a donor name.
#[must_use]
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Returns the 5-digit ZIP prefix. Anything after the prefix is ignored.
///
/// # Errors
/// Returns [`RecordRejection::MalformedZip`] when the first five characters
/// are not all ASCII digits.
pub fn zip_prefix(raw: &str) -> Result<&str, RecordRejection> {
    match raw.get(..ZIP_PREFIX_LEN) {
        Some(prefix) if prefix.bytes().all(|byte| byte.is_ascii_digit()) => Ok(prefix),
        _ => Err(RecordRejection::MalformedZip(raw.to_string())),
    }
}

/// Parses an `MMDDYYYY` transaction date and returns its year.
///
/// # Errors
/// Returns [`RecordRejection::MalformedDate`] for anything that is not a real
/// calendar date in that format.
pub fn parse_year(raw: &str) -> Result<i32, RecordRejection> {
    Date::parse(raw.trim(), format_description!("[month][day][year]"))
        .map(Date::year)
        .map_err(|_| RecordRejection::MalformedDate(raw.to_string()))
}

/// Parses a dollar amount with at most two fractional digits into cents.
///
/// # Errors
/// Returns [`RecordRejection::MalformedAmount`] for non-numeric input and
/// [`RecordRejection::NonPositiveAmount`] for zero or negative amounts.
pub fn parse_cents(raw: &str) -> Result<u64, RecordRejection> {
    let value = raw.trim();
    let malformed = || RecordRejection::MalformedAmount(raw.to_string());

    let (negative, unsigned) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };
    let (whole, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if (whole.is_empty() && frac.is_empty())
        || frac.len() > 2
        || !whole.bytes().all(|byte| byte.is_ascii_digit())
        || !frac.bytes().all(|byte| byte.is_ascii_digit())
    {
        return Err(malformed());
    }

    let dollars: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| malformed())?
    };
    let cents: u64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<u64>().map_err(|_| malformed())? * 10,
        _ => frac.parse().map_err(|_| malformed())?,
    };
    let total = dollars
        .checked_mul(100)
        .and_then(|value| value.checked_add(cents))
        .ok_or_else(malformed)?;

    if negative || total == 0 {
        return Err(RecordRejection::NonPositiveAmount(raw.to_string()));
    }
    Ok(total)
}

/// Rounds cents to whole dollars; 50 cents and up round up.
#[must_use]
pub fn round_to_dollars(cents: u64) -> u64 {
    cents.saturating_add(50) / 100
}

/// Whole dollars when there are no cents, `dollars.cc` otherwise.
#[must_use]
pub fn format_dollars(cents: u128) -> String {
    if cents % 100 == 0 {
        (cents / 100).to_string()
    } else {
        format!("{}.{:02}", cents / 100, cents % 100)
    }
}

/// Splits one input line into pipe-delimited fields, reusing `record`.
/// Quotes are not special; FEC names carry stray ones.
fn split_fields(line: &str, record: &mut StringRecord) {
    record.clear();
    for field in line.split('|') {
        record.push_field(field);
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Reads the percentile from the first line of `raw`.
///
/// # Errors
/// Returns an error when the text is empty or the value is not a valid
/// percentile.
pub fn parse_percentile_text(raw: &str) -> Result<Percentile> {
    let first = raw
        .lines()
        .next()
        .filter(|line| !line.trim().is_empty())
        .ok_or_else(|| anyhow!("percentile input is empty"))?;
    first.parse::<Percentile>().map_err(|err| anyhow!("{err}"))
}

/// Reads the percentile file.
///
/// # Errors
/// Returns an error when the file cannot be read or holds no valid percentile.
pub fn read_percentile(path: &Path) -> Result<Percentile> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading percentile file {}", path.display()))?;
    parse_percentile_text(&body)
        .with_context(|| format!("invalid percentile file {}", path.display()))
}

/// Writes stats as pipe-delimited lines.
#[derive(Debug)]
pub struct PipeDelimitedSink<W: Write> {
    writer: W,
}

impl<W: Write> PipeDelimitedSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Flushes and returns the underlying writer.
    ///
    /// # Errors
    /// Returns the flush error, if any.
    pub fn into_inner(mut self) -> std::io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> StatsSink for PipeDelimitedSink<W> {
    type Error = std::io::Error;

    fn emit(&mut self, stats: &RepeatDonationStats) -> Result<(), Self::Error> {
        writeln!(
            self.writer,
            "{}|{}|{}|{}|{}|{}",
            stats.recipient,
            stats.zip,
            stats.year,
            round_to_dollars(stats.percentile_amount),
            format_dollars(stats.total_amount),
            stats.count
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub lines_read: u64,
    pub valid_records: u64,
    pub skipped_records: u64,
    pub comment_lines: u64,
    pub repeat_donations: u64,
    pub elapsed_ms: f64,
}

/// Streams `input` through `processor`, forwarding every repeat-donation row
/// to `sink` as soon as its record has been read.
///
/// Bad lines are logged at debug level and skipped; they never stop the run.
/// Every physical line is counted, blank ones included.
///
/// # Errors
/// Returns an error when reading the input or writing to the sink fails.
pub fn run_pipeline<R, S>(
    mut input: R,
    layout: &ColumnLayout,
    processor: &mut StreamProcessor,
    sink: &mut S,
) -> Result<RunSummary>
where
    R: BufRead,
    S: StatsSink,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let started = Instant::now();
    let mut summary = RunSummary::default();
    let mut buffer = Vec::new();
    let mut record = StringRecord::new();

    loop {
        buffer.clear();
        let read = input
            .read_until(b'\n', &mut buffer)
            .context("failed reading contribution records")?;
        if read == 0 {
            break;
        }
        summary.lines_read += 1;
        let line = summary.lines_read;

        let outcome = match std::str::from_utf8(strip_line_ending(&buffer)) {
            Ok(text) => {
                split_fields(text, &mut record);
                layout.classify(&record)
            }
            Err(_) => LineOutcome::Rejected(RecordRejection::NotUtf8),
        };

        match outcome {
            LineOutcome::Comment => {
                summary.comment_lines += 1;
                debug!(line, "skipping line because it is commented out");
            }
            LineOutcome::Rejected(reason) => {
                summary.skipped_records += 1;
                debug!(line, %reason, "skipping line");
            }
            LineOutcome::Valid(contribution) => {
                summary.valid_records += 1;
                if let Some(stats) = processor.process(&contribution) {
                    sink.emit(&stats)
                        .with_context(|| format!("failed emitting stats for line {line}"))?;
                    summary.repeat_donations += 1;
                }
            }
        }
    }

    summary.elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    info!(
        lines_read = summary.lines_read,
        valid_records = summary.valid_records,
        skipped_records = summary.skipped_records,
        comment_lines = summary.comment_lines,
        repeat_donations = summary.repeat_donations,
        elapsed_ms = summary.elapsed_ms,
        "finished processing contribution records"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fec_record(
        recipient: &str,
        name: &str,
        zip: &str,
        date: &str,
        amount: &str,
        other_id: &str,
    ) -> StringRecord {
        let mut fields = vec![""; 21];
        fields[0] = recipient;
        fields[7] = name;
        fields[10] = zip;
        fields[13] = date;
        fields[14] = amount;
        fields[15] = other_id;
        StringRecord::from(fields)
    }

    fn rejection(record: &StringRecord) -> RecordRejection {
        match ColumnLayout::fec_individual().classify(record) {
            LineOutcome::Rejected(reason) => reason,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn valid_record_is_normalized() {
        let record = fec_record(
            "C00384818",
            "  abbott,   joseph ",
            "028956146",
            "01122017",
            "250.5",
            "",
        );

        let outcome = ColumnLayout::fec_individual().classify(&record);
        assert_eq!(
            outcome,
            LineOutcome::Valid(ContributionRecord::new(
                "C00384818",
                "ABBOTT, JOSEPH",
                "02895",
                2017,
                25_050
            ))
        );
    }

    #[test]
    fn checks_run_in_order() {
        assert_eq!(
            rejection(&fec_record("", "", "1", "", "-3", "H6CA34245")),
            RecordRejection::OtherIdPresent("H6CA34245".to_string())
        );
        assert_eq!(
            rejection(&fec_record("C00-1", "", "1", "", "-3", " ")),
            RecordRejection::InvalidRecipient
        );
        assert_eq!(
            rejection(&fec_record("C001", "  ", "1", "", "-3", "")),
            RecordRejection::BlankName
        );
        assert_eq!(
            rejection(&fec_record("C001", "A", "1234", "", "-3", "")),
            RecordRejection::MalformedZip("1234".to_string())
        );
        assert_eq!(
            rejection(&fec_record("C001", "A", "12a45", "", "-3", "")),
            RecordRejection::MalformedZip("12a45".to_string())
        );
        assert_eq!(
            rejection(&fec_record("C001", "A", "12345", " ", "-3", "")),
            RecordRejection::MissingDate
        );
        assert_eq!(
            rejection(&fec_record("C001", "A", "12345", "13452017", "-3", "")),
            RecordRejection::NonPositiveAmount("-3".to_string())
        );
        assert_eq!(
            rejection(&fec_record("C001", "A", "12345", "13452017", "12", "")),
            RecordRejection::MalformedDate("13452017".to_string())
        );
    }

    #[test]
    fn comment_blank_and_short_lines() {
        let layout = ColumnLayout::fec_individual();
        assert_eq!(
            layout.classify(&StringRecord::from(vec!["# exported 2017", "x"])),
            LineOutcome::Comment
        );
        assert_eq!(
            layout.classify(&StringRecord::from(vec!["   "])),
            LineOutcome::Rejected(RecordRejection::Blank)
        );
        assert_eq!(
            layout.classify(&StringRecord::from(vec!["C001", "N", "TER"])),
            LineOutcome::Rejected(RecordRejection::FieldCount {
                expected: 21,
                found: 3
            })
        );
    }

    #[test]
    fn fields_split_on_pipes_without_quoting() {
        let mut record = StringRecord::new();
        split_fields("C001|\"ODD\" NAME||", &mut record);
        assert_eq!(record.len(), 4);
        assert_eq!(record.get(1), Some("\"ODD\" NAME"));

        split_fields("", &mut record);
        assert_eq!(record.len(), 1);
        assert_eq!(
            ColumnLayout::fec_individual().classify(&record),
            LineOutcome::Rejected(RecordRejection::Blank)
        );
    }

    #[test]
    fn line_endings_are_stripped() {
        assert_eq!(strip_line_ending(b"a|b\r\n"), b"a|b");
        assert_eq!(strip_line_ending(b"a|b\n"), b"a|b");
        assert_eq!(strip_line_ending(b"a|b"), b"a|b");
    }

    #[test]
    fn zip_plus_four_and_trailing_text_keep_prefix() {
        assert_eq!(must_ok(zip_prefix("300047357")), "30004");
        assert_eq!(must_ok(zip_prefix("02895-DONTKNOW")), "02895");
    }

    #[test]
    fn amounts_parse_to_cents() {
        assert_eq!(must_ok(parse_cents("40")), 4_000);
        assert_eq!(must_ok(parse_cents("384.00")), 38_400);
        assert_eq!(must_ok(parse_cents("0.5")), 50);
        assert_eq!(must_ok(parse_cents("+12.34")), 1_234);
        assert_eq!(must_ok(parse_cents(".07")), 7);

        for raw in ["", "abc", "1.234", "1e3", "NaN", "1.2.3", "-"] {
            assert_eq!(
                parse_cents(raw),
                Err(RecordRejection::MalformedAmount(raw.to_string())),
                "{raw:?}"
            );
        }
        for raw in ["0", "0.00", "-20"] {
            assert_eq!(
                parse_cents(raw),
                Err(RecordRejection::NonPositiveAmount(raw.to_string()))
            );
        }
    }

    #[test]
    fn dates_need_a_real_calendar_day() {
        assert_eq!(must_ok(parse_year("01312017")), 2017);
        assert_eq!(must_ok(parse_year("02292016")), 2016);
        assert!(parse_year("02292017").is_err());
        assert!(parse_year("2017-01-31").is_err());
        assert!(parse_year("1312017").is_err());
    }

    #[test]
    fn dollars_formatting() {
        assert_eq!(round_to_dollars(33_349), 333);
        assert_eq!(round_to_dollars(33_350), 334);
        assert_eq!(format_dollars(71_700), "717");
        assert_eq!(format_dollars(81_750), "817.50");
        assert_eq!(format_dollars(5), "0.05");
        assert_eq!(
            format_dollars(20_000_000_000_000_000_000),
            "200000000000000000"
        );
    }

    #[test]
    fn header_layout_finds_required_columns() {
        let header = "CMTE_ID,AMNDT_IND,RPT_TP,TRANSACTION_PGI,IMAGE_NUM,TRANSACTION_TP,\
ENTITY_TP,NAME,CITY,STATE,ZIP_CODE,EMPLOYER,OCCUPATION,TRANSACTION_DT,TRANSACTION_AMT,\
OTHER_ID,TRAN_ID,FILE_NUM,MEMO_CD,MEMO_TEXT,SUB_ID";
        assert_eq!(
            must_ok(ColumnLayout::from_header(header)),
            ColumnLayout::fec_individual()
        );
    }

    #[test]
    fn header_layout_reports_missing_column() {
        let err = ColumnLayout::from_header("CMTE_ID,NAME,ZIP_CODE").err();
        assert_eq!(
            err,
            Some(LayoutError::MissingColumn {
                column: "TRANSACTION_DT".to_string(),
                available: "CMTE_ID,NAME,ZIP_CODE".to_string(),
            })
        );
        assert_eq!(
            ColumnLayout::from_header("  ").err(),
            Some(LayoutError::EmptyHeader)
        );
    }

    #[test]
    fn percentile_text_uses_first_line() {
        assert_eq!(must_ok(parse_percentile_text("30\n99\n")).hundredths(), 3_000);
        assert!(parse_percentile_text("\n30\n").is_err());
        assert!(parse_percentile_text("").is_err());
        assert!(parse_percentile_text("150").is_err());
    }

    #[test]
    fn pipe_sink_formats_rows() {
        let mut sink = PipeDelimitedSink::new(Vec::new());
        must_ok(sink.emit(&RepeatDonationStats {
            recipient: "C00384516".to_string(),
            zip: "02895".to_string(),
            year: 2018,
            percentile_amount: 33_300,
            total_amount: 81_750,
            count: 3,
        }));
        let bytes = must_ok(sink.into_inner());
        assert_eq!(String::from_utf8_lossy(&bytes), "C00384516|02895|2018|333|817.50|3\n");
    }
}
