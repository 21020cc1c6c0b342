//! Typed SELECT queries.
//!
//! The reducer and the range planner only ever ask two questions of an
//! mpileup object: "give me one column" and "give me the rows whose
//! coordinate lies in `[a, b]`". [`SelectQuery`] models exactly that and
//! renders to S3 Select SQL; [`evaluate`] runs the same query over a local
//! file.

use crate::{RecordIter, Result, StoreError};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use serde_json::Value;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Headerless, delimited text.
    Csv { delimiter: u8 },
    Parquet,
}

impl InputFormat {
    pub const TSV: InputFormat = InputFormat::Csv { delimiter: b'\t' };
}

/// A column, addressed by its 1-based position in CSV input and by its name
/// in Parquet input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub position: usize,
    pub name: String,
}

impl ColumnRef {
    pub fn new(position: usize, name: impl Into<String>) -> Result<Self> {
        if position == 0 {
            return Err(StoreError::InvalidRequest(
                "column positions are 1-based".to_string(),
            ));
        }
        Ok(ColumnRef {
            position,
            name: name.into(),
        })
    }

    fn sql(&self, input: InputFormat) -> String {
        match input {
            InputFormat::Csv { .. } => format!("s._{}", self.position),
            InputFormat::Parquet => format!("s.\"{}\"", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    All,
    Column(ColumnRef),
}

/// Keep rows whose integer value in `column` lies in `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilter {
    pub column: ColumnRef,
    pub start: i64,
    pub end: i64,
}

impl RangeFilter {
    fn accepts(&self, value: i64) -> bool {
        self.start <= value && value <= self.end
    }
}

/// A query over one object. Results are always delimited text with
/// `output_delimiter` between fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    pub projection: Projection,
    pub filter: Option<RangeFilter>,
    pub input: InputFormat,
    pub output_delimiter: u8,
}

impl SelectQuery {
    /// `SELECT s._n FROM S3Object s`
    pub fn column(column: ColumnRef, input: InputFormat) -> Self {
        SelectQuery {
            projection: Projection::Column(column),
            filter: None,
            input,
            output_delimiter: b'\t',
        }
    }

    /// `SELECT * FROM S3Object s WHERE CAST(s._n AS INT) BETWEEN a AND b`
    pub fn rows_between(column: ColumnRef, start: i64, end: i64, input: InputFormat) -> Self {
        SelectQuery {
            projection: Projection::All,
            filter: Some(RangeFilter { column, start, end }),
            input,
            output_delimiter: b'\t',
        }
    }

    /// The S3 Select expression.
    pub fn to_sql(&self) -> String {
        let projection = match &self.projection {
            Projection::All => "*".to_string(),
            Projection::Column(c) => c.sql(self.input),
        };
        let mut sql = format!("SELECT {projection} FROM S3Object s");
        if let Some(f) = &self.filter {
            sql.push_str(&format!(
                " WHERE CAST({} AS INT) BETWEEN {} AND {}",
                f.column.sql(self.input),
                f.start,
                f.end
            ));
        }
        sql
    }
}

/// Run `query` over a local file holding the object body.
pub fn evaluate(path: &Path, bucket: &str, key: &str, query: &SelectQuery) -> Result<RecordIter> {
    let fail = {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        move |reason: String| StoreError::Select {
            bucket: bucket.clone(),
            key: key.clone(),
            reason,
        }
    };
    let file = File::open(path).map_err(|e| fail(e.to_string()))?;
    let query = query.clone();
    let delimiter = char::from(query.output_delimiter).to_string();
    let input = query.input;
    match input {
        InputFormat::Csv { delimiter: input_delimiter } => {
            let reader = csv::ReaderBuilder::new()
                .delimiter(input_delimiter)
                .has_headers(false)
                .flexible(true)
                .quoting(false)
                .from_reader(file);
            let iter = reader.into_records().filter_map(move |record| {
                let fields: Vec<String> = match record {
                    Ok(r) => r.iter().map(str::to_string).collect(),
                    Err(e) => return Some(Err(fail(e.to_string()))),
                };
                project(fields, &query, &delimiter).map_err(&fail).transpose()
            });
            Ok(Box::new(iter))
        }
        InputFormat::Parquet => {
            let reader = SerializedFileReader::new(file).map_err(|e| fail(e.to_string()))?;
            if reader.metadata().file_metadata().num_rows() == 0 {
                return Ok(Box::new(std::iter::empty()));
            }
            let iter = reader.into_iter().filter_map(move |row| {
                let fields: Vec<String> = match row {
                    Ok(row) => row
                        .get_column_iter()
                        .map(|(_, field)| field_to_string(field))
                        .collect(),
                    Err(e) => return Some(Err(fail(e.to_string()))),
                };
                project(fields, &query, &delimiter).map_err(&fail).transpose()
            });
            Ok(Box::new(iter))
        }
    }
}

/// Apply the filter and projection to one row. `Ok(None)` drops the row.
fn project(
    fields: Vec<String>,
    query: &SelectQuery,
    delimiter: &str,
) -> std::result::Result<Option<String>, String> {
    if fields.iter().all(String::is_empty) {
        return Ok(None);
    }
    let column = |c: &ColumnRef| -> std::result::Result<&str, String> {
        c.position
            .checked_sub(1)
            .and_then(|i| fields.get(i))
            .map(String::as_str)
            .ok_or_else(|| format!("row has no column {}", c.position))
    };
    if let Some(filter) = &query.filter {
        let raw = column(&filter.column)?;
        let value: i64 = raw
            .trim()
            .parse()
            .map_err(|_| format!("cannot cast '{raw}' to INT"))?;
        if !filter.accepts(value) {
            return Ok(None);
        }
    }
    Ok(Some(match &query.projection {
        Projection::All => fields.join(delimiter),
        Projection::Column(c) => column(c)?.to_string(),
    }))
}

fn field_to_string(field: &Field) -> String {
    match field.to_json_value() {
        Value::String(s) => s,
        Value::Null => String::new(),
        v => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn pos() -> ColumnRef {
        ColumnRef::new(2, "pos").unwrap()
    }

    #[test]
    fn test_to_sql() {
        assert_eq!(
            SelectQuery::column(pos(), InputFormat::TSV).to_sql(),
            "SELECT s._2 FROM S3Object s"
        );
        assert_eq!(
            SelectQuery::rows_between(pos(), 1, 500, InputFormat::TSV).to_sql(),
            "SELECT * FROM S3Object s WHERE CAST(s._2 AS INT) BETWEEN 1 AND 500"
        );
        assert_eq!(
            SelectQuery::rows_between(pos(), 7, 9, InputFormat::Parquet).to_sql(),
            "SELECT * FROM S3Object s WHERE CAST(s.\"pos\" AS INT) BETWEEN 7 AND 9"
        );
    }

    #[test]
    fn test_evaluate_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.mpileup.csv");
        let mut f = File::create(&path).unwrap();
        write!(f, "chr1\t5\tA\t3\t...\tIII\nchr1\t12\tC\t1\t,\tI\nchr1\t40\tG\t2\t.,\tII\n")
            .unwrap();
        drop(f);

        let rows: Vec<String> = evaluate(
            &path,
            "b",
            "k",
            &SelectQuery::rows_between(pos(), 10, 40, InputFormat::TSV),
        )
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
        assert_eq!(rows, vec!["chr1\t12\tC\t1\t,\tI", "chr1\t40\tG\t2\t.,\tII"]);

        let coords: Vec<String> = evaluate(
            &path,
            "b",
            "k",
            &SelectQuery::column(pos(), InputFormat::TSV),
        )
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
        assert_eq!(coords, vec!["5", "12", "40"]);
    }

    #[test]
    fn test_column_positions_start_at_one() {
        assert!(matches!(
            ColumnRef::new(0, "chrom"),
            Err(StoreError::InvalidRequest(_))
        ));
        assert_eq!(ColumnRef::new(1, "chrom").unwrap().sql(InputFormat::TSV), "s._1");
    }

    #[test]
    fn test_evaluate_keeps_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.mpileup.csv");
        let row = "chr1\t7\tC\t3\t^\".,\tI\"#";
        std::fs::write(&path, format!("{row}\n")).unwrap();
        let rows: Vec<String> = evaluate(
            &path,
            "b",
            "k",
            &SelectQuery::rows_between(pos(), 1, 9, InputFormat::TSV),
        )
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
        assert_eq!(rows, vec![row]);
    }

    #[test]
    fn test_evaluate_csv_bad_cast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "chr1\tnotanumber\tA\n").unwrap();
        let mut rows = evaluate(
            &path,
            "b",
            "bad.csv",
            &SelectQuery::rows_between(pos(), 1, 2, InputFormat::TSV),
        )
        .unwrap();
        assert!(matches!(rows.next(), Some(Err(StoreError::Select { .. }))));
    }

    #[derive(parquet_derive::ParquetRecordWriter)]
    struct PileupRow {
        chrom: String,
        pos: i64,
        depth: i64,
    }

    #[test]
    fn test_evaluate_parquet() {
        use parquet::file::properties::WriterProperties;
        use parquet::file::writer::SerializedFileWriter;
        use parquet::record::RecordWriter;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.parquet");
        let rows = vec![
            PileupRow {
                chrom: "chr2".into(),
                pos: 3,
                depth: 8,
            },
            PileupRow {
                chrom: "chr2".into(),
                pos: 9,
                depth: 1,
            },
        ];
        let schema = rows.as_slice().schema().unwrap();
        let mut writer = SerializedFileWriter::new(
            File::create(&path).unwrap(),
            schema,
            WriterProperties::builder().build().into(),
        )
        .unwrap();
        let mut group = writer.next_row_group().unwrap();
        rows.as_slice().write_to_row_group(&mut group).unwrap();
        group.close().unwrap();
        writer.close().unwrap();

        let out: Vec<String> = evaluate(
            &path,
            "b",
            "k",
            &SelectQuery::rows_between(pos(), 5, 10, InputFormat::Parquet),
        )
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();
        assert_eq!(out, vec!["chr2\t9\t1"]);
    }
}
