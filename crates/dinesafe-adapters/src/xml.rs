//! XML snapshot loading into an untyped table.

use std::path::Path;

use dinesafe_core::SnapshotId;
use roxmltree::{Document, ParsingOptions};
use tracing::debug;

use crate::IngestError;

/// Rows of one snapshot, exactly as published: every child of the document root is a
/// row, every child element (or attribute) of a row is a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub snapshot: SnapshotId,
    /// Column names in first-seen order.
    pub columns: Vec<String>,
    /// Cells aligned with `columns`; rows may be shorter than `columns`.
    pub rows: Vec<Vec<Option<String>>>,
}

impl RawTable {
    pub fn new(snapshot: SnapshotId) -> Self {
        Self {
            snapshot,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(column))
            .and_then(|cell| cell.as_deref())
    }

    fn column_slot(&mut self, name: &str) -> usize {
        match self.columns.iter().position(|c| c == name) {
            Some(index) => index,
            None => {
                self.columns.push(name.to_string());
                self.columns.len() - 1
            }
        }
    }

    fn set_cell(cells: &mut Vec<Option<String>>, index: usize, value: Option<String>) {
        if cells.len() <= index {
            cells.resize(index + 1, None);
        }
        if cells[index].is_none() {
            cells[index] = value;
        }
    }
}

/// The snapshot id of an extracted file is the name of the directory holding it.
pub fn snapshot_id_for_path(xml_path: &Path) -> Result<SnapshotId, IngestError> {
    let dir_name = xml_path
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    SnapshotId::parse(&dir_name).map_err(|source| IngestError::SnapshotName {
        path: xml_path.to_path_buf(),
        source,
    })
}

pub fn read_snapshot_table(xml_path: &Path) -> Result<RawTable, IngestError> {
    let snapshot = snapshot_id_for_path(xml_path)?;
    let bytes = std::fs::read(xml_path).map_err(|source| IngestError::Io {
        path: xml_path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);
    parse_snapshot_xml(snapshot, &text)
}

pub fn parse_snapshot_xml(snapshot: SnapshotId, text: &str) -> Result<RawTable, IngestError> {
    let mut options = ParsingOptions::default();
    options.allow_dtd = true;
    let doc = Document::parse_with_options(text, options).map_err(|source| IngestError::Xml {
        snapshot: snapshot.clone(),
        source,
    })?;

    let mut table = RawTable::new(snapshot);
    for row_node in doc.root_element().children().filter(|n| n.is_element()) {
        let mut cells = Vec::with_capacity(table.columns.len());

        for attr in row_node.attributes() {
            let index = table.column_slot(attr.name());
            RawTable::set_cell(&mut cells, index, non_blank(attr.value()));
        }

        for field in row_node.children().filter(|n| n.is_element()) {
            let index = table.column_slot(field.tag_name().name());
            let text = field
                .descendants()
                .filter(|d| d.is_text())
                .filter_map(|d| d.text())
                .collect::<String>();
            RawTable::set_cell(&mut cells, index, non_blank(&text));
        }

        table.rows.push(cells);
    }

    debug!(
        snapshot = %table.snapshot,
        rows = table.rows.len(),
        columns = table.columns.len(),
        "parsed snapshot xml"
    );
    Ok(table)
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE ROWDATA>
<ROWDATA>
  <ROW id="a1">
    <ROW_ID>1</ROW_ID>
    <ESTABLISHMENT_ID>9001</ESTABLISHMENT_ID>
    <SEVERITY>   </SEVERITY>
  </ROW>
  <ROW>
    <ESTABLISHMENT_ID>9002</ESTABLISHMENT_ID>
    <LATITUDE>43.65</LATITUDE>
  </ROW>
</ROWDATA>
"#;

    fn snapshot() -> SnapshotId {
        SnapshotId::parse("20190116215713").unwrap()
    }

    #[test]
    fn rows_and_columns_follow_document_order() {
        let table = parse_snapshot_xml(snapshot(), SAMPLE).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.columns,
            vec!["id", "ROW_ID", "ESTABLISHMENT_ID", "SEVERITY", "LATITUDE"]
        );
        let est = table.column_index("establishment_id").unwrap();
        assert_eq!(table.cell(0, est), Some("9001"));
        assert_eq!(table.cell(1, est), Some("9002"));
    }

    #[test]
    fn blank_and_absent_cells_are_missing() {
        let table = parse_snapshot_xml(snapshot(), SAMPLE).unwrap();
        let severity = table.column_index("SEVERITY").unwrap();
        let latitude = table.column_index("LATITUDE").unwrap();
        assert_eq!(table.cell(0, severity), None);
        assert_eq!(table.cell(0, latitude), None);
        assert_eq!(table.cell(1, latitude), Some("43.65"));
        assert_eq!(table.cell(1, table.column_index("ROW_ID").unwrap()), None);
    }

    #[test]
    fn malformed_xml_is_reported_with_snapshot() {
        let err = parse_snapshot_xml(snapshot(), "<ROWDATA><ROW></ROWDATA>").unwrap_err();
        assert!(matches!(err, IngestError::Xml { .. }));
        assert!(err.to_string().contains("20190116215713"));
    }

    #[test]
    fn file_is_tagged_with_its_directory_snapshot_id() {
        let dir = tempdir().unwrap();
        let snapshot_dir = dir.path().join("20130723222156");
        std::fs::create_dir_all(&snapshot_dir).unwrap();
        let path = snapshot_dir.join("dinesafe.xml");
        std::fs::write(&path, SAMPLE).unwrap();

        let table = read_snapshot_table(&path).unwrap();
        assert_eq!(table.snapshot.as_str(), "20130723222156");

        let bad = dir.path().join("latest").join("dinesafe.xml");
        assert!(matches!(
            snapshot_id_for_path(&bad),
            Err(IngestError::SnapshotName { .. })
        ));
    }
}
