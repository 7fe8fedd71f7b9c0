use super::schema::{ImportRow, Schema};
use super::xlsx::{self, SheetRow};
use super::{ImportError, ImportResult};
use serde::Serialize;
use std::collections::HashMap;

const OLE_SIGNATURE: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Xlsx,
    Csv,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub format: FileFormat,
    pub rows: Vec<ImportRow>,
    /// Optional schema columns the file does not have.
    pub missing_optional: Vec<&'static str>,
    /// Header cells that match no schema column.
    pub ignored_columns: Vec<String>,
}

pub fn read(bytes: &[u8], schema: &Schema) -> ImportResult<Table> {
    if bytes.is_empty() {
        return Err(ImportError::MalformedFile("the file is empty".to_string()));
    }
    if bytes.starts_with(OLE_SIGNATURE) {
        return Err(ImportError::MalformedFile(
            "legacy .xls workbooks are not supported; save the sheet as .xlsx or .csv".to_string(),
        ));
    }
    let (format, raw) = if xlsx::is_xlsx(bytes) {
        (FileFormat::Xlsx, xlsx::read_first_sheet(bytes)?)
    } else {
        (FileFormat::Csv, read_delimited(bytes)?)
    };
    build_table(format, raw, schema)
}

fn read_delimited(bytes: &[u8]) -> ImportResult<Vec<SheetRow>> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        ImportError::MalformedFile(format!("the file is neither a workbook nor UTF-8 text: {e}"))
    })?;
    let text = text.trim_start_matches('\u{FEFF}');
    let delimiter = sniff_delimiter(text);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| {
            ImportError::MalformedFile(format!("cannot parse delimited text: {e}"))
        })?;
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(idx + 1);
        rows.push((line, record.iter().map(str::to_string).collect()));
    }
    Ok(rows)
}

/// Picks the delimiter that occurs most often in the first non-empty line.
fn sniff_delimiter(text: &str) -> u8 {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let candidates = [b',', b';', b'\t'];
    let mut best = b',';
    let mut best_count = 0usize;
    for c in candidates {
        let count = first.bytes().filter(|b| *b == c).count();
        if count > best_count {
            best = c;
            best_count = count;
        }
    }
    best
}

fn build_table(format: FileFormat, raw: Vec<SheetRow>, schema: &Schema) -> ImportResult<Table> {
    let mut rows = raw
        .into_iter()
        .filter(|(_, cells)| cells.iter().any(|c| !c.trim().is_empty()));

    let mut index: HashMap<&'static str, usize> = HashMap::new();
    let mut missing_optional = Vec::new();
    let mut ignored_columns = Vec::new();

    if schema.has_header {
        let Some((_, header)) = rows.next() else {
            return Err(ImportError::MalformedFile(format!(
                "the file has no header row; expected columns: {}",
                schema.headers().join(", ")
            )));
        };
        for (i, cell) in header.iter().enumerate() {
            match schema.match_header(cell) {
                Some(col) => {
                    if index.insert(col.key, i).is_some() {
                        return Err(ImportError::MalformedFile(format!(
                            "column \"{}\" appears more than once",
                            col.header
                        )));
                    }
                }
                None => {
                    let t = cell.trim();
                    if !t.is_empty() {
                        ignored_columns.push(t.to_string());
                    }
                }
            }
        }
        let missing_required = schema
            .columns
            .iter()
            .filter(|c| c.required && !index.contains_key(c.key))
            .map(|c| c.header)
            .collect::<Vec<_>>();
        if !missing_required.is_empty() {
            return Err(ImportError::MalformedFile(format!(
                "missing required column(s): {}; expected columns: {}",
                missing_required.join(", "),
                schema.headers().join(", ")
            )));
        }
        missing_optional = schema
            .columns
            .iter()
            .filter(|c| !c.required && !index.contains_key(c.key))
            .map(|c| c.header)
            .collect();
    } else {
        for (i, col) in schema.columns.iter().enumerate() {
            index.insert(col.key, i);
        }
    }

    let rows = rows
        .map(|(line, cells)| {
            ImportRow::from_cells(schema.kind, line, |key| {
                index
                    .get(key)
                    .and_then(|&i| cells.get(i))
                    .map(String::as_str)
            })
        })
        .collect();

    Ok(Table {
        format,
        rows,
        missing_optional,
        ignored_columns,
    })
}
