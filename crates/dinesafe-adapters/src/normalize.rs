//! Coercion of raw snapshot rows into typed infraction records.

use chrono::{NaiveDate, NaiveDateTime};
use dinesafe_core::{Column, InfractionRecord};

use crate::{IngestError, RawTable};

const REQUIRED_COLUMNS: [Column; 8] = [
    Column::EstablishmentId,
    Column::InspectionId,
    Column::EstablishmentName,
    Column::EstablishmentType,
    Column::EstablishmentAddress,
    Column::EstablishmentStatus,
    Column::MinimumInspectionsPerYear,
    Column::InspectionDate,
];

/// Column positions of one raw table, resolved once per snapshot.
struct Layout {
    indices: [Option<usize>; Column::COUNT],
}

impl Layout {
    fn resolve(table: &RawTable) -> Self {
        let mut indices = [None; Column::COUNT];
        for (slot, column) in indices.iter_mut().zip(Column::ALL) {
            *slot = table.column_index(column.name());
        }
        Self { indices }
    }

    fn index(&self, column: Column) -> Option<usize> {
        Column::ALL
            .iter()
            .position(|c| *c == column)
            .and_then(|i| self.indices[i])
    }
}

struct RowReader<'a> {
    table: &'a RawTable,
    layout: &'a Layout,
    row: usize,
}

impl<'a> RowReader<'a> {
    fn optional(&self, column: Column) -> Option<&'a str> {
        self.layout
            .index(column)
            .and_then(|index| self.table.cell(self.row, index))
    }

    fn required(&self, column: Column) -> Result<&'a str, IngestError> {
        self.optional(column).ok_or_else(|| IngestError::MissingValue {
            snapshot: self.table.snapshot.clone(),
            row: self.row,
            column: column.name(),
        })
    }

    fn invalid(&self, column: Column, value: &str) -> IngestError {
        IngestError::InvalidValue {
            snapshot: self.table.snapshot.clone(),
            row: self.row,
            column: column.name(),
            value: value.to_string(),
        }
    }

    fn text(&self, column: Column) -> Option<String> {
        self.optional(column).map(str::to_string)
    }

    fn required_text(&self, column: Column) -> Result<String, IngestError> {
        self.required(column).map(str::to_string)
    }

    fn required_int(&self, column: Column) -> Result<i64, IngestError> {
        let raw = self.required(column)?;
        parse_int(raw).ok_or_else(|| self.invalid(column, raw))
    }

    fn optional_int(&self, column: Column) -> Result<Option<i64>, IngestError> {
        self.optional(column)
            .map(|raw| parse_int(raw).ok_or_else(|| self.invalid(column, raw)))
            .transpose()
    }

    fn coerced_float(&self, column: Column) -> Option<f64> {
        self.optional(column).and_then(parse_float)
    }
}

/// Lower-case the raw columns, coerce types and tag every row with its snapshot.
///
/// Geolocation columns are optional: older snapshots do not publish them, and their
/// rows get missing coordinates.
pub fn normalize_table(table: &RawTable) -> Result<Vec<InfractionRecord>, IngestError> {
    if table.is_empty() {
        return Ok(Vec::new());
    }

    let layout = Layout::resolve(table);
    for column in REQUIRED_COLUMNS {
        if layout.index(column).is_none() {
            return Err(IngestError::MissingColumn {
                snapshot: table.snapshot.clone(),
                column: column.name(),
            });
        }
    }

    (0..table.len())
        .map(|row| {
            let reader = RowReader {
                table,
                layout: &layout,
                row,
            };
            normalize_row(&reader)
        })
        .collect()
}

fn normalize_row(reader: &RowReader<'_>) -> Result<InfractionRecord, IngestError> {
    let raw_date = reader.required(Column::InspectionDate)?;
    let inspection_date =
        parse_date(raw_date).ok_or_else(|| reader.invalid(Column::InspectionDate, raw_date))?;

    Ok(InfractionRecord {
        row_id: reader.optional_int(Column::RowId)?,
        establishment_id: reader.required_int(Column::EstablishmentId)?,
        inspection_id: reader.required_int(Column::InspectionId)?,
        establishment_name: reader.required_text(Column::EstablishmentName)?,
        establishment_type: reader.required_text(Column::EstablishmentType)?,
        establishment_address: reader.required_text(Column::EstablishmentAddress)?,
        latitude: reader.coerced_float(Column::Latitude),
        longitude: reader.coerced_float(Column::Longitude),
        establishment_status: reader.required_text(Column::EstablishmentStatus)?,
        minimum_inspections_per_year: reader.required_int(Column::MinimumInspectionsPerYear)?,
        infraction_details: reader.text(Column::InfractionDetails),
        inspection_date,
        severity: reader.text(Column::Severity),
        action: reader.text(Column::Action),
        court_outcome: reader.text(Column::CourtOutcome),
        amount_fined: reader.optional(Column::AmountFined).and_then(parse_amount),
        snapshot: reader.table.snapshot.clone(),
    })
}

/// Integers may be published as `12` or `12.0`.
pub fn parse_int(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(value);
    }
    let value = trimmed.parse::<f64>().ok()?;
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

pub fn parse_float(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Fine amounts use thousands separators (`1,250.00`); anything unparsable is missing.
pub fn parse_amount(raw: &str) -> Option<f64> {
    parse_float(&raw.replace(',', ""))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(ts.date());
        }
    }
    if let Some(prefix) = trimmed.get(..10) {
        if trimmed.as_bytes().get(10) == Some(&b'T') {
            if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
                return Some(date);
            }
        }
    }
    NaiveDate::parse_from_str(trimmed, "%m/%d/%Y").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_snapshot_xml;
    use dinesafe_core::SnapshotId;

    fn table(rows: &str) -> RawTable {
        let xml = format!("<ROWDATA>{rows}</ROWDATA>");
        parse_snapshot_xml(SnapshotId::parse("20150603085055").unwrap(), &xml).unwrap()
    }

    const FULL_ROW: &str = r#"<ROW>
        <ROW_ID>7</ROW_ID>
        <ESTABLISHMENT_ID>10283</ESTABLISHMENT_ID>
        <INSPECTION_ID>103356017</INSPECTION_ID>
        <ESTABLISHMENT_NAME>CAFE X</ESTABLISHMENT_NAME>
        <ESTABLISHMENTTYPE>Restaurant</ESTABLISHMENTTYPE>
        <ESTABLISHMENT_ADDRESS>100 QUEEN ST W</ESTABLISHMENT_ADDRESS>
        <ESTABLISHMENT_STATUS>Pass</ESTABLISHMENT_STATUS>
        <MINIMUM_INSPECTIONS_PERYEAR>3.0</MINIMUM_INSPECTIONS_PERYEAR>
        <INFRACTION_DETAILS>FAIL TO PROVIDE HAND WASHING</INFRACTION_DETAILS>
        <INSPECTION_DATE>2015-04-02T00:00:00</INSPECTION_DATE>
        <SEVERITY>S - Significant</SEVERITY>
        <ACTION>Notice to Comply</ACTION>
        <COURT_OUTCOME></COURT_OUTCOME>
        <AMOUNT_FINED>1,250.00</AMOUNT_FINED>
    </ROW>"#;

    #[test]
    fn full_row_is_coerced_and_tagged() {
        let records = normalize_table(&table(FULL_ROW)).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.row_id, Some(7));
        assert_eq!(record.establishment_id, 10283);
        assert_eq!(record.minimum_inspections_per_year, 3);
        assert_eq!(
            record.inspection_date,
            NaiveDate::from_ymd_opt(2015, 4, 2).unwrap()
        );
        assert_eq!(record.amount_fined, Some(1250.0));
        assert_eq!(record.court_outcome, None);
        assert_eq!(record.latitude, None);
        assert_eq!(record.longitude, None);
        assert_eq!(record.snapshot.as_str(), "20150603085055");
    }

    #[test]
    fn geolocation_columns_are_used_when_published() {
        let row = FULL_ROW.replace(
            "</ROW>",
            "<LATITUDE>43.6487</LATITUDE><LONGITUDE>not-a-number</LONGITUDE></ROW>",
        );
        let records = normalize_table(&table(&row)).unwrap();
        assert_eq!(records[0].latitude, Some(43.6487));
        assert_eq!(records[0].longitude, None);
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let row = FULL_ROW.replace("<INSPECTION_ID>103356017</INSPECTION_ID>", "");
        let err = normalize_table(&table(&row)).unwrap_err();
        assert!(matches!(
            err,
            IngestError::MissingColumn {
                column: "inspection_id",
                ..
            }
        ));
    }

    #[test]
    fn invalid_required_value_names_row_and_column() {
        let second = FULL_ROW.replace(
            "<MINIMUM_INSPECTIONS_PERYEAR>3.0</MINIMUM_INSPECTIONS_PERYEAR>",
            "<MINIMUM_INSPECTIONS_PERYEAR>three</MINIMUM_INSPECTIONS_PERYEAR>",
        );
        let err = normalize_table(&table(&format!("{FULL_ROW}{second}"))).unwrap_err();
        match err {
            IngestError::InvalidValue { row, column, value, .. } => {
                assert_eq!(row, 1);
                assert_eq!(column, "minimum_inspections_peryear");
                assert_eq!(value, "three");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_snapshot_normalizes_to_nothing() {
        assert!(normalize_table(&table("")).unwrap().is_empty());
    }

    #[test]
    fn date_formats_seen_across_snapshots() {
        let expected = NaiveDate::from_ymd_opt(2013, 7, 22);
        assert_eq!(parse_date("2013-07-22"), expected);
        assert_eq!(parse_date("2013-07-22T00:00:00"), expected);
        assert_eq!(parse_date("2013-07-22 00:00:00"), expected);
        assert_eq!(parse_date("2013-07-22T00:00:00-04:00"), expected);
        assert_eq!(parse_date("07/22/2013"), expected);
        assert_eq!(parse_date("22.07.2013"), None);
    }

    #[test]
    fn amounts_drop_thousands_separators() {
        assert_eq!(parse_amount("55"), Some(55.0));
        assert_eq!(parse_amount("2,000.50"), Some(2000.5));
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_int("4.5"), None);
    }
}
