//! CSV persistence for flow records.
//!
//! One column per spine level per dimension plus a count column:
//!
//! ```text
//! LEVEL0_ORIG,LEVEL1_ORIG,LEVEL2_ORIG,LEVEL0_DEST,LEVEL1_DEST,LEVEL2_DEST,COUNT
//! 0,A,1,0,B,1,7
//! ```
//!
//! Released tables are written with the same layout so they can be read
//! back into a [`FlowTable`] for evaluation.

use super::{FlowRecord, FlowTable};
use crate::spine::Spine;
use anyhow::{anyhow, bail, Context, Result};
use std::io::{Read, Write};
use std::path::Path;
use tracing::info;

/// Name of the flow-count column.
pub const COUNT_COLUMN: &str = "COUNT";

pub fn origin_column(level: usize) -> String {
    format!("LEVEL{}_ORIG", level)
}

pub fn destination_column(level: usize) -> String {
    format!("LEVEL{}_DEST", level)
}

/// Header for a table of the given depth.
pub fn column_names(depth: usize) -> Vec<String> {
    (0..=depth)
        .map(origin_column)
        .chain((0..=depth).map(destination_column))
        .chain(std::iter::once(COUNT_COLUMN.to_string()))
        .collect()
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

/// Depth implied by the header: the highest contiguous `LEVEL<k>_ORIG`.
fn infer_depth(headers: &csv::StringRecord) -> Result<usize> {
    let mut depth = None;
    while column_index(headers, &origin_column(depth.map_or(0, |d| d + 1))).is_some() {
        depth = Some(depth.map_or(0, |d| d + 1));
    }
    depth.ok_or_else(|| anyhow!("missing column {}", origin_column(0)))
}

/// Read flow records from any CSV source.
pub fn read_records<R: Read>(source: R) -> Result<Vec<FlowRecord>> {
    let mut reader = csv::Reader::from_reader(source);
    let headers = reader.headers()?.clone();
    let depth = infer_depth(&headers)?;

    let lookup = |name: String| {
        column_index(&headers, &name).ok_or_else(|| anyhow!("missing column {}", name))
    };
    let origin_idx = (0..=depth)
        .map(|l| lookup(origin_column(l)))
        .collect::<Result<Vec<_>>>()?;
    let destination_idx = (0..=depth)
        .map(|l| lookup(destination_column(l)))
        .collect::<Result<Vec<_>>>()?;
    let count_idx = lookup(COUNT_COLUMN.to_string())?;

    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("Failed to read row {}", idx + 1))?;
        let field = |i: usize| row.get(i).map(str::trim).unwrap_or_default().to_string();
        let count_text = field(count_idx);
        let count: u64 = count_text
            .parse()
            .with_context(|| format!("Row {}: invalid count '{}'", idx + 1, count_text))?;
        records.push(FlowRecord {
            origin: origin_idx.iter().map(|i| field(*i)).collect(),
            destination: destination_idx.iter().map(|i| field(*i)).collect(),
            count,
        });
    }
    Ok(records)
}

/// Write flow records; all records must share one path length.
pub fn write_records<W: Write>(sink: W, records: &[FlowRecord]) -> Result<()> {
    let depth = match records.first() {
        Some(first) if first.origin.is_empty() => bail!("flow record with empty origin path"),
        Some(first) => first.origin.len() - 1,
        None => 0,
    };
    let mut writer = csv::Writer::from_writer(sink);
    writer.write_record(column_names(depth))?;
    for (idx, record) in records.iter().enumerate() {
        if record.origin.len() != depth + 1 || record.destination.len() != depth + 1 {
            bail!("record {} does not have {} levels", idx, depth + 1);
        }
        let count = record.count.to_string();
        writer.write_record(
            record
                .origin
                .iter()
                .chain(record.destination.iter())
                .map(String::as_str)
                .chain(std::iter::once(count.as_str())),
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_csv(path: &Path) -> Result<Vec<FlowRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
    read_records(file).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn write_csv(path: &Path, records: &[FlowRecord]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
    write_records(file, records)?;
    info!("Wrote {} flow records to {}", records.len(), path.display());
    Ok(())
}

/// Load a flow table from CSV against an existing spine.
pub fn load_table(path: &Path, spine: &Spine) -> Result<FlowTable> {
    let records = read_csv(path)?;
    info!("Loaded {} flow records from {}", records.len(), path.display());
    FlowTable::new(spine, records).with_context(|| format!("Invalid flow table {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
LEVEL0_ORIG,LEVEL1_ORIG,LEVEL2_ORIG,LEVEL0_DEST,LEVEL1_DEST,LEVEL2_DEST,COUNT
0,A,1,0,B,1,7
0,A,2,0,A,1,3
";

    #[test]
    fn header_layout() {
        assert_eq!(
            column_names(1),
            vec!["LEVEL0_ORIG", "LEVEL1_ORIG", "LEVEL0_DEST", "LEVEL1_DEST", "COUNT"]
        );
    }

    #[test]
    fn reads_sample() {
        let records = read_records(SAMPLE.as_bytes()).unwrap();
        assert_eq!(
            records,
            vec![
                FlowRecord::new(["0", "A", "1"], ["0", "B", "1"], 7),
                FlowRecord::new(["0", "A", "2"], ["0", "A", "1"], 3),
            ]
        );
    }

    #[test]
    fn columns_may_be_reordered() {
        let csv = "COUNT,LEVEL0_DEST,LEVEL1_DEST,LEVEL0_ORIG,LEVEL1_ORIG\n5,0,B,0,A\n";
        let records = read_records(csv.as_bytes()).unwrap();
        assert_eq!(records, vec![FlowRecord::new(["0", "A"], ["0", "B"], 5)]);
    }

    #[test]
    fn missing_destination_column_fails() {
        let csv = "LEVEL0_ORIG,LEVEL1_ORIG,LEVEL0_DEST,COUNT\n0,A,0,1\n";
        let err = read_records(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("LEVEL1_DEST"));
    }

    #[test]
    fn bad_count_reports_row() {
        let csv = "LEVEL0_ORIG,LEVEL0_DEST,COUNT\n0,0,-3\n";
        let err = read_records(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Row 1"));
    }

    #[test]
    fn file_round_trip_through_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.csv");
        let records = read_records(SAMPLE.as_bytes()).unwrap();
        write_csv(&path, &records).unwrap();

        let spine = Spine::from_json_str(r#"{"A": {"1": {}, "2": {}}, "B": {"1": {}}}"#).unwrap();
        let table = load_table(&path, &spine).unwrap();
        assert_eq!(table.total(), 10);
        assert_eq!(table.records(), records);
    }

    #[test]
    fn zero_count_row_with_unknown_node_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typo.csv");
        std::fs::write(&path, format!("{}0,A,1,0,Bx,1,0\n", SAMPLE)).unwrap();

        let spine = Spine::from_json_str(r#"{"A": {"1": {}, "2": {}}, "B": {"1": {}}}"#).unwrap();
        let err = load_table(&path, &spine).unwrap_err();
        assert!(format!("{:#}", err).contains("Bx"));
    }

    #[test]
    fn ragged_records_are_not_written() {
        let records = vec![
            FlowRecord::new(["0", "A"], ["0", "B"], 1),
            FlowRecord::new(["0"], ["0"], 1),
        ];
        let mut sink = Vec::new();
        assert!(write_records(&mut sink, &records).is_err());
    }
}
