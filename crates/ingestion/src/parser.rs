//! Row parser and validator
//!
//! Streams typed records out of delimited text files. Each column has a
//! value kind and a strictness; each data row becomes a valid record, a
//! counted skip, or a hard error depending on the [`ParsePolicy`].
//!
//! Row numbers are 1-based over data rows (the header is not counted) and
//! include skipped rows, so ordinals used by signal files stay stable.

use crate::errors::IngestionError;
use bminty_common::db::models::CellKind;
use csv::StringRecord;
use std::collections::HashMap;
use std::fs::File;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Tokens that mean "no value", compared case-insensitively
const MISSING_TOKENS: &[&str] = &["na", "n/a", "null", "nan", "none"];

/// Column names accepted for the signal value
pub const SIGNAL_ALIASES: &[&str] = &["value", "signal_value", "signalvalue", "score", "expression", "expr"];

/// How a column participates in validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Column must be in the header and every row must carry a typeable value
    Mandatory,
    /// Missing values are NULL; untypeable values follow the policy
    Optional,
    /// Supplied by the importer; a file column of this name is ignored
    Predetermined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Integer,
    Float,
}

/// One column of an import file
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: ValueKind,
    pub strictness: Strictness,
}

impl ColumnSpec {
    pub const fn mandatory(name: &'static str, kind: ValueKind) -> Self {
        Self { name, aliases: &[], kind, strictness: Strictness::Mandatory }
    }

    pub const fn optional(name: &'static str, kind: ValueKind) -> Self {
        Self { name, aliases: &[], kind, strictness: Strictness::Optional }
    }

    pub const fn predetermined(name: &'static str) -> Self {
        Self { name, aliases: &[], kind: ValueKind::Integer, strictness: Strictness::Predetermined }
    }

    pub const fn with_aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }
}

/// Row error policy of one import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsePolicy {
    /// Skip and count failing rows instead of aborting
    pub ignore_row_errors: bool,
    /// Null untypeable optional values instead of failing the row
    pub ignore_optional_type_errors: bool,
}

/// Running counters of one file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseCounters {
    pub processed: u64,
    pub valid: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Optional values nulled under `ignore_optional_type_errors`
    pub nulled: u64,
}

/// Result of parsing one row that did not abort the file
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome<T> {
    Valid(T),
    Skipped { row: u64, reason: String },
}

// ============================================================================
// Value normalization
// ============================================================================

/// Empty cells and NA-style tokens carry no value
pub fn is_missing(raw: &str) -> bool {
    let raw = raw.trim();
    raw.is_empty() || MISSING_TOKENS.iter().any(|t| raw.eq_ignore_ascii_case(t))
}

/// Normalize European number formats to plain decimal text.
///
/// Whitespace is dropped. With a comma present, `.` is a thousands
/// separator and `,` the decimal point. Two or more `.` without a comma
/// are thousands separators.
pub fn normalize_number(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.contains(',') {
        compact.replace('.', "").replace(',', ".")
    } else if compact.matches('.').count() >= 2 {
        compact.replace('.', "")
    } else {
        compact
    }
}

/// Finite float after normalization
pub fn parse_float(raw: &str) -> Option<f64> {
    normalize_number(raw)
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Integer after normalization; `12.0` is accepted, `12.5` and out-of-range values are not
pub fn parse_int(raw: &str) -> Option<i64> {
    let normalized = normalize_number(raw);
    if let Ok(v) = normalized.parse::<i64>() {
        return Some(v);
    }
    let v = normalized.parse::<f64>().ok()?;
    // 2^53: beyond this an f64 no longer holds every integer
    if v.fract() == 0.0 && v.abs() <= 9_007_199_254_740_992.0 {
        Some(v as i64)
    } else {
        None
    }
}

// ============================================================================
// Header and row access
// ============================================================================

/// Normalized header of one file
#[derive(Debug, Clone, Default)]
pub struct Header {
    positions: HashMap<String, usize>,
}

impl Header {
    /// Trim and lower-case names; drop `unnamed*` index columns
    pub fn from_record(record: &StringRecord) -> Self {
        let mut positions = HashMap::with_capacity(record.len());
        for (i, name) in record.iter().enumerate() {
            let name = name.trim().trim_start_matches('\u{feff}').to_lowercase();
            if name.is_empty() || name.starts_with("unnamed") {
                continue;
            }
            positions.entry(name).or_insert(i);
        }
        Self { positions }
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Position of a column under its name or any alias
    pub fn position(&self, spec: &ColumnSpec) -> Option<usize> {
        std::iter::once(&spec.name)
            .chain(spec.aliases.iter())
            .find_map(|name| self.positions.get(*name).copied())
    }

    /// Every mandatory column must be present
    pub fn require(&self, columns: &[ColumnSpec]) -> Result<(), String> {
        match columns
            .iter()
            .find(|c| c.strictness == Strictness::Mandatory && self.position(c).is_none())
        {
            Some(missing) => Err(format!("missing mandatory column '{}'", missing.name)),
            None => Ok(()),
        }
    }
}

/// Typed access to one data row, collecting failures as it goes
pub struct Fields<'a> {
    record: &'a StringRecord,
    header: &'a Header,
    policy: ParsePolicy,
    row: u64,
    nulled: u64,
    failures: Vec<String>,
}

impl<'a> Fields<'a> {
    fn new(record: &'a StringRecord, header: &'a Header, policy: ParsePolicy, row: u64) -> Self {
        Self {
            record,
            header,
            policy,
            row,
            nulled: 0,
            failures: Vec::new(),
        }
    }

    /// 1-based data row number
    pub fn row(&self) -> u64 {
        self.row
    }

    /// Whether the file has the column at all
    pub fn has(&self, spec: &ColumnSpec) -> bool {
        self.header.position(spec).is_some()
    }

    /// Number signals use to reference this row: the `id` value when the
    /// file has an `id` column, otherwise the data row number
    pub fn key(&mut self, id: &ColumnSpec) -> Option<i64> {
        if self.has(id) {
            self.integer(id)
        } else {
            Some(self.row as i64)
        }
    }

    /// Raw trimmed value, `None` when absent or missing
    pub fn value(&self, spec: &ColumnSpec) -> Option<&'a str> {
        let index = self.header.position(spec)?;
        let raw = self.record.get(index)?.trim();
        (!is_missing(raw)).then_some(raw)
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.failures.push(message.into());
    }

    pub fn text(&mut self, spec: &ColumnSpec) -> Option<String> {
        self.typed(spec, |raw| Some(raw.to_string()), "text")
    }

    pub fn integer(&mut self, spec: &ColumnSpec) -> Option<i64> {
        self.typed(spec, parse_int, "an integer")
    }

    pub fn float(&mut self, spec: &ColumnSpec) -> Option<f64> {
        self.typed(spec, parse_float, "a number")
    }

    fn typed<T>(&mut self, spec: &ColumnSpec, parse: impl Fn(&str) -> Option<T>, expected: &str) -> Option<T> {
        if spec.strictness == Strictness::Predetermined {
            return None;
        }
        let Some(raw) = self.value(spec) else {
            if spec.strictness == Strictness::Mandatory {
                self.fail(format!("missing {}", spec.name));
            }
            return None;
        };

        match parse(raw) {
            Some(v) => Some(v),
            None if spec.strictness == Strictness::Optional && self.policy.ignore_optional_type_errors => {
                self.nulled += 1;
                None
            }
            None => {
                self.fail(format!("{} '{}' is not {}", spec.name, raw, expected));
                None
            }
        }
    }
}

/// Typed record of one import file
pub trait RowSchema: Sized + Send + 'static {
    /// Table the records are written to
    const TABLE: &'static str;

    fn columns() -> &'static [ColumnSpec];

    /// Structural check of the header
    fn check_header(header: &Header) -> Result<(), String> {
        header.require(Self::columns())
    }

    /// Build a record; `None` or any recorded failure makes the row fail
    fn read(fields: &mut Fields<'_>) -> Option<Self>;
}

// ============================================================================
// Records
// ============================================================================

pub mod interval_columns {
    use super::{ColumnSpec, ValueKind};

    pub const ID: ColumnSpec = ColumnSpec::optional("id", ValueKind::Integer);
    pub const EXTERNAL_ID: ColumnSpec = ColumnSpec::mandatory("external_id", ValueKind::Text);
    pub const PARENTAL_ID: ColumnSpec = ColumnSpec::optional("parental_id", ValueKind::Text);
    pub const NAME: ColumnSpec = ColumnSpec::optional("name", ValueKind::Text);
    pub const TYPE: ColumnSpec = ColumnSpec::mandatory("type", ValueKind::Text);
    pub const BIOTYPE: ColumnSpec = ColumnSpec::optional("biotype", ValueKind::Text);
    pub const CHROMOSOME: ColumnSpec = ColumnSpec::mandatory("chromosome", ValueKind::Text);
    pub const START: ColumnSpec = ColumnSpec::mandatory("start", ValueKind::Integer);
    pub const END: ColumnSpec = ColumnSpec::mandatory("end", ValueKind::Integer);
    pub const STRAND: ColumnSpec = ColumnSpec::mandatory("strand", ValueKind::Text);
    pub const SUMMIT: ColumnSpec = ColumnSpec::optional("summit", ValueKind::Integer);
    pub const ASSEMBLY_ID: ColumnSpec = ColumnSpec::predetermined("assembly_id");

    pub const ALL: &[ColumnSpec] = &[
        ID, EXTERNAL_ID, PARENTAL_ID, NAME, TYPE, BIOTYPE, CHROMOSOME, START, END, STRAND, SUMMIT,
        ASSEMBLY_ID,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalRecord {
    pub row: u64,
    /// Reference number for signal `interval_id`; `None` when the row has no usable `id`
    pub key: Option<i64>,
    pub external_id: String,
    pub parental_id: Option<String>,
    pub name: Option<String>,
    pub kind: String,
    pub biotype: Option<String>,
    pub chromosome: String,
    pub start: i64,
    pub end: i64,
    pub strand: String,
    pub summit: Option<i64>,
}

impl RowSchema for IntervalRecord {
    const TABLE: &'static str = "interval";

    fn columns() -> &'static [ColumnSpec] {
        interval_columns::ALL
    }

    fn read(f: &mut Fields<'_>) -> Option<Self> {
        use interval_columns::*;

        let key = f.key(&ID);
        let external_id = f.text(&EXTERNAL_ID);
        let parental_id = f.text(&PARENTAL_ID);
        let name = f.text(&NAME);
        let kind = f.text(&TYPE);
        let biotype = f.text(&BIOTYPE);
        let chromosome = f.text(&CHROMOSOME);
        let start = f.integer(&START);
        let end = f.integer(&END);
        let strand = f.text(&STRAND);
        let summit = f.integer(&SUMMIT);

        Some(Self {
            row: f.row(),
            key,
            external_id: external_id?,
            parental_id,
            name,
            kind: kind?,
            biotype,
            chromosome: chromosome?,
            start: start?,
            end: end?,
            strand: strand?,
            summit,
        })
    }
}

pub mod cell_columns {
    use super::{ColumnSpec, ValueKind};

    pub const ID: ColumnSpec = ColumnSpec::optional("id", ValueKind::Integer);
    pub const NAME: ColumnSpec = ColumnSpec::mandatory("name", ValueKind::Text);
    pub const TYPE: ColumnSpec = ColumnSpec::mandatory("type", ValueKind::Text);
    pub const LABEL: ColumnSpec = ColumnSpec::optional("label", ValueKind::Text);
    pub const X: ColumnSpec = ColumnSpec::optional("x_coordinate", ValueKind::Integer);
    pub const Y: ColumnSpec = ColumnSpec::optional("y_coordinate", ValueKind::Integer);
    pub const Z: ColumnSpec = ColumnSpec::optional("z_coordinate", ValueKind::Integer);
    pub const ASSAY_ID: ColumnSpec = ColumnSpec::predetermined("assay_id");

    pub const ALL: &[ColumnSpec] = &[ID, NAME, TYPE, LABEL, X, Y, Z, ASSAY_ID];
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub row: u64,
    /// Reference number for signal `cell_id`
    pub key: Option<i64>,
    pub name: String,
    pub kind: CellKind,
    pub label: Option<String>,
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub z: Option<i64>,
}

impl RowSchema for CellRecord {
    const TABLE: &'static str = "cell";

    fn columns() -> &'static [ColumnSpec] {
        cell_columns::ALL
    }

    fn read(f: &mut Fields<'_>) -> Option<Self> {
        use cell_columns::*;

        let key = f.key(&ID);

        // An empty type means a spatial spot
        let kind = match f.value(&TYPE) {
            None => Some(CellKind::Spot),
            Some(raw) => {
                let kind = CellKind::parse(raw);
                if kind.is_none() {
                    f.fail(format!("type '{}' is neither cell nor spot", raw));
                }
                kind
            }
        };
        let label = f.text(&LABEL);
        let name = f
            .value(&NAME)
            .map(str::to_string)
            .or_else(|| label.clone())
            .unwrap_or_else(|| format!("cell_{}", f.row()));
        let x = f.integer(&X);
        let y = f.integer(&Y);
        let z = f.integer(&Z);

        Some(Self {
            row: f.row(),
            key,
            name,
            kind: kind?,
            label,
            x,
            y,
            z,
        })
    }
}

pub mod signal_columns {
    use super::{ColumnSpec, ValueKind, SIGNAL_ALIASES};

    pub const SIGNAL: ColumnSpec = ColumnSpec::mandatory("signal", ValueKind::Float).with_aliases(SIGNAL_ALIASES);
    pub const P_VALUE: ColumnSpec = ColumnSpec::optional("p_value", ValueKind::Float).with_aliases(&["pvalue"]);
    pub const PADJ_VALUE: ColumnSpec = ColumnSpec::optional("padj_value", ValueKind::Float).with_aliases(&["padj", "p_adj"]);
    pub const INTERVAL_ID: ColumnSpec = ColumnSpec::optional("interval_id", ValueKind::Integer);
    pub const INTERVAL_EXTERNAL_ID: ColumnSpec = ColumnSpec::optional("interval_external_id", ValueKind::Text);
    pub const CELL_ID: ColumnSpec = ColumnSpec::optional("cell_id", ValueKind::Integer);
    pub const CELL_NAME: ColumnSpec = ColumnSpec::optional("cell_name", ValueKind::Text).with_aliases(&["cell"]);
    pub const ASSAY_ID: ColumnSpec = ColumnSpec::predetermined("assay_id");

    pub const ALL: &[ColumnSpec] = &[
        SIGNAL, P_VALUE, PADJ_VALUE, INTERVAL_ID, INTERVAL_EXTERNAL_ID, CELL_ID, CELL_NAME, ASSAY_ID,
    ];
}

/// How a signal row names its interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalRef {
    /// `id` (or data row number) of an interval file row in the same import
    Key(i64),
    External(String),
}

/// How a signal row names its cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellRef {
    /// `id` (or data row number) of a cell file row in the same import
    Key(i64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalRecord {
    pub row: u64,
    pub value: f64,
    pub p_value: Option<f64>,
    pub padj_value: Option<f64>,
    pub interval: IntervalRef,
    pub cell: Option<CellRef>,
}

impl RowSchema for SignalRecord {
    const TABLE: &'static str = "signal";

    fn columns() -> &'static [ColumnSpec] {
        signal_columns::ALL
    }

    fn check_header(header: &Header) -> Result<(), String> {
        use signal_columns::*;

        header.require(Self::columns())?;
        if header.position(&INTERVAL_ID).is_none() && header.position(&INTERVAL_EXTERNAL_ID).is_none() {
            return Err("missing interval reference column 'interval_id' or 'interval_external_id'".into());
        }
        Ok(())
    }

    fn read(f: &mut Fields<'_>) -> Option<Self> {
        use signal_columns::*;

        let value = f.float(&SIGNAL);
        let p_value = f.float(&P_VALUE);
        let padj_value = f.float(&PADJ_VALUE);

        let interval = match f.integer(&INTERVAL_ID) {
            Some(n) => Some(IntervalRef::Key(n)),
            None => f.text(&INTERVAL_EXTERNAL_ID).map(IntervalRef::External),
        };
        if interval.is_none() {
            f.fail("missing interval reference");
        }

        let cell = f.integer(&CELL_ID).map(CellRef::Key).or_else(|| f.text(&CELL_NAME).map(CellRef::Name));

        Some(Self {
            row: f.row(),
            value: value?,
            p_value,
            padj_value,
            interval: interval?,
            cell,
        })
    }
}

// ============================================================================
// Sources
// ============================================================================

/// A restartable file of rows: every call to [`RowSource::rows`] reads from the start
#[derive(Debug, Clone)]
pub struct RowSource {
    path: PathBuf,
    label: String,
}

impl RowSource {
    /// `label` names the file in structural errors (e.g. the upload field)
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn reader(&self) -> Result<csv::Reader<File>, IngestionError> {
        csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| {
                IngestionError::structural(&self.label, format!("cannot open {}: {}", self.path.display(), e))
            })
    }

    /// Number of data rows
    pub fn count_rows(&self) -> Result<u64, IngestionError> {
        let mut reader = self.reader()?;
        let mut record = csv::ByteRecord::new();
        let mut rows = 0;
        while reader.read_byte_record(&mut record)? {
            rows += 1;
        }
        Ok(rows)
    }

    /// Parse the file from its first data row
    pub fn rows<T: RowSchema>(&self, policy: ParsePolicy) -> Result<RowIter<T>, IngestionError> {
        let mut reader = self.reader()?;
        let header = Header::from_record(reader.headers()?);

        // A file with no header at all holds no rows
        if !header.is_empty() {
            T::check_header(&header).map_err(|m| IngestionError::structural(&self.label, m))?;
        }

        Ok(RowIter {
            records: reader.into_records(),
            header,
            policy,
            counters: ParseCounters::default(),
            row: 0,
            _record: PhantomData,
        })
    }
}

/// Lazy sequence of parsed rows
pub struct RowIter<T> {
    records: csv::StringRecordsIntoIter<File>,
    header: Header,
    policy: ParsePolicy,
    counters: ParseCounters,
    row: u64,
    _record: PhantomData<T>,
}

impl<T> RowIter<T> {
    pub fn counters(&self) -> ParseCounters {
        self.counters
    }
}

impl<T: RowSchema> Iterator for RowIter<T> {
    type Item = Result<RowOutcome<T>, IngestionError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(e) => return Some(Err(e.into())),
        };
        self.row += 1;
        self.counters.processed += 1;

        let (parsed, nulled, failures) = {
            let mut fields = Fields::new(&record, &self.header, self.policy, self.row);
            let parsed = T::read(&mut fields);
            (parsed, fields.nulled, fields.failures)
        };
        self.counters.nulled += nulled;

        let reason = match parsed {
            Some(record) if failures.is_empty() => {
                self.counters.valid += 1;
                return Some(Ok(RowOutcome::Valid(record)));
            }
            _ if failures.is_empty() => "invalid row".to_string(),
            _ => failures.join("; "),
        };

        self.counters.errors += 1;
        if self.policy.ignore_row_errors {
            self.counters.skipped += 1;
            debug!(table = T::TABLE, row = self.row, reason = %reason, "Row skipped");
            Some(Ok(RowOutcome::Skipped {
                row: self.row,
                reason,
            }))
        } else {
            Some(Err(IngestionError::Row {
                table: T::TABLE,
                row: self.row,
                message: reason,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source(dir: &tempfile::TempDir, name: &str, content: &str) -> RowSource {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        RowSource::new(path, name)
    }

    fn collect<T: RowSchema>(src: &RowSource, policy: ParsePolicy) -> (Vec<RowOutcome<T>>, ParseCounters) {
        let mut rows = src.rows::<T>(policy).unwrap();
        let mut out = Vec::new();
        while let Some(item) = rows.next() {
            out.push(item.unwrap());
        }
        (out, rows.counters())
    }

    #[test]
    fn test_missing_tokens() {
        for raw in ["", "  ", "NA", "n/a", "NULL", "NaN", "none"] {
            assert!(is_missing(raw), "{:?}", raw);
        }
        assert!(!is_missing("0"));
        assert!(!is_missing("nano"));
    }

    #[test]
    fn test_number_normalization() {
        assert_eq!(parse_float("1,5"), Some(1.5));
        assert_eq!(parse_float("1.234,5"), Some(1234.5));
        assert_eq!(parse_float("1.234.567"), Some(1_234_567.0));
        assert_eq!(parse_float(" 2 500 "), Some(2500.0));
        assert_eq!(parse_float("inf"), None);
        assert_eq!(parse_float("abc"), None);

        assert_eq!(parse_int("12"), Some(12));
        assert_eq!(parse_int("12.0"), Some(12));
        assert_eq!(parse_int("12.5"), None);
        assert_eq!(parse_int("1.000.000"), Some(1_000_000));
        assert_eq!(parse_int("99999999999999999999"), None);
    }

    #[test]
    fn test_header_is_normalized() {
        let header = Header::from_record(&StringRecord::from(vec!["Unnamed: 0", " External_ID ", "TYPE", ""]));
        assert!(header.contains("external_id"));
        assert!(header.contains("type"));
        assert!(!header.contains("unnamed: 0"));
        assert_eq!(header.position(&interval_columns::EXTERNAL_ID), Some(1));
    }

    #[test]
    fn test_missing_mandatory_column_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&dir, "interval_file", "external_id,type,chromosome,start,strand\ng1,gene,chr1,1,+\n");
        let err = src.rows::<IntervalRecord>(ParsePolicy::default()).err().unwrap();
        assert!(matches!(err, IngestionError::Structural { .. }));
        assert!(err.to_string().contains("'end'"));
    }

    #[test]
    fn test_intervals_parse_with_index_column_and_predetermined() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(
            &dir,
            "intervals.csv",
            ",external_id,type,chromosome,start,end,strand,summit,assembly_id\n\
             0,g1,gene,chr1,100,200.0,+,NA,99\n",
        );
        let (rows, counters) = collect::<IntervalRecord>(&src, ParsePolicy::default());
        assert_eq!(counters.valid, 1);
        match &rows[0] {
            RowOutcome::Valid(rec) => {
                assert_eq!(rec.external_id, "g1");
                assert_eq!(rec.end, 200);
                assert_eq!(rec.summit, None);
                assert_eq!(rec.row, 1);
                assert_eq!(rec.key, Some(1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_id_column_becomes_reference_key() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(
            &dir,
            "intervals.csv",
            "id,external_id,type,chromosome,start,end,strand
             42,gB,gene,chr1,1,5,+
             7,gA,gene,chr1,9,15,+
             ,gC,gene,chr1,20,25,-
",
        );
        let (rows, _) = collect::<IntervalRecord>(&src, ParsePolicy::default());
        let keys: Vec<Option<i64>> = rows
            .iter()
            .map(|r| match r {
                RowOutcome::Valid(rec) => rec.key,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(keys, vec![Some(42), Some(7), None]);

        let cells = source(&dir, "cells.csv", "id,name,type
3,c3,cell
");
        let (rows, _) = collect::<CellRecord>(&cells, ParsePolicy::default());
        assert!(matches!(rows[0], RowOutcome::Valid(CellRecord { key: Some(3), .. })));
    }

    #[test]
    fn test_mandatory_failure_aborts_without_ignore() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(
            &dir,
            "intervals.csv",
            "external_id,type,chromosome,start,end,strand\ng1,gene,chr1,abc,5,+\n",
        );
        let mut rows = src.rows::<IntervalRecord>(ParsePolicy::default()).unwrap();
        let err = rows.next().unwrap().unwrap_err();
        assert!(matches!(err, IngestionError::Row { row: 1, .. }));
    }

    #[test]
    fn test_mandatory_failure_skips_with_ignore() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(
            &dir,
            "intervals.csv",
            "external_id,type,chromosome,start,end,strand\n,gene,chr1,1,5,+\ng2,gene,chr1,1,5,-\n",
        );
        let policy = ParsePolicy {
            ignore_row_errors: true,
            // Does not rescue a mandatory failure
            ignore_optional_type_errors: true,
        };
        let (rows, counters) = collect::<IntervalRecord>(&src, policy);
        assert!(matches!(rows[0], RowOutcome::Skipped { row: 1, .. }));
        assert!(matches!(rows[1], RowOutcome::Valid(IntervalRecord { row: 2, .. })));
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.valid, 1);
    }

    #[test]
    fn test_optional_type_error_policy() {
        let dir = tempfile::tempdir().unwrap();
        let content = "external_id,type,chromosome,start,end,strand,summit\ng1,gene,chr1,1,5,+,top\n";
        let src = source(&dir, "intervals.csv", content);

        let mut strict = src.rows::<IntervalRecord>(ParsePolicy::default()).unwrap();
        assert!(strict.next().unwrap().is_err());

        let policy = ParsePolicy {
            ignore_optional_type_errors: true,
            ..Default::default()
        };
        let (rows, counters) = collect::<IntervalRecord>(&src, policy);
        assert!(matches!(rows[0], RowOutcome::Valid(IntervalRecord { summit: None, .. })));
        assert_eq!(counters.nulled, 1);
    }

    #[test]
    fn test_cell_type_and_name_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(
            &dir,
            "cells.csv",
            "name,type,label,x_coordinate\nAAAC,single cell,,\n,SRT,T-cell,12\n,,,\n",
        );
        let (rows, _) = collect::<CellRecord>(&src, ParsePolicy::default());
        let cells: Vec<&CellRecord> = rows
            .iter()
            .map(|r| match r {
                RowOutcome::Valid(c) => c,
                other => panic!("unexpected {:?}", other),
            })
            .collect();

        assert_eq!(cells[0].kind, CellKind::Cell);
        assert_eq!(cells[0].name, "AAAC");
        assert_eq!(cells[1].kind, CellKind::Spot);
        assert_eq!(cells[1].name, "T-cell");
        assert_eq!(cells[1].x, Some(12));
        assert_eq!(cells[2].kind, CellKind::Spot);
        assert_eq!(cells[2].name, "cell_3");
    }

    #[test]
    fn test_untypeable_cell_type_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&dir, "cells.csv", "name,type\nc1,nucleus\n");
        let mut rows = src.rows::<CellRecord>(ParsePolicy::default()).unwrap();
        assert!(rows.next().unwrap().is_err());
    }

    #[test]
    fn test_signal_aliases_and_references() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(
            &dir,
            "signals.csv",
            "Score,interval_id,interval_external_id,cell\n3,2,,c1\n\"4,5\",,g7,\n",
        );
        let (rows, _) = collect::<SignalRecord>(&src, ParsePolicy::default());

        assert_eq!(
            rows[0],
            RowOutcome::Valid(SignalRecord {
                row: 1,
                value: 3.0,
                p_value: None,
                padj_value: None,
                interval: IntervalRef::Key(2),
                cell: Some(CellRef::Name("c1".into())),
            })
        );
        assert_eq!(
            rows[1],
            RowOutcome::Valid(SignalRecord {
                row: 2,
                value: 4.5,
                p_value: None,
                padj_value: None,
                interval: IntervalRef::External("g7".into()),
                cell: None,
            })
        );
    }

    #[test]
    fn test_signal_file_needs_interval_reference() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&dir, "signal_file", "signal,cell_id\n1,1\n");
        let err = src.rows::<SignalRecord>(ParsePolicy::default()).err().unwrap();
        assert!(matches!(err, IngestionError::Structural { .. }));
    }

    #[test]
    fn test_source_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&dir, "signals.csv", "signal,interval_id\n1,1\n2,2\n3,3\n");
        assert_eq!(src.count_rows().unwrap(), 3);
        let (first, _) = collect::<SignalRecord>(&src, ParsePolicy::default());
        let (second, _) = collect::<SignalRecord>(&src, ParsePolicy::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_file_has_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&dir, "cells.csv", "");
        let (rows, counters) = collect::<CellRecord>(&src, ParsePolicy::default());
        assert!(rows.is_empty());
        assert_eq!(counters.processed, 0);
    }
}
