//! Bulk import of delimited text into a user table. Every record is validated
//! and inserted on its own; the ones that fail are reported with their line
//! number.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array, StringArray};
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::catalog::CatalogError;
use crate::data_types::TableId;

use super::{SchemaSynchronizer, SyncResult};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ImportRowError {
    /// 1-based line number in the submitted text, the header being line 1
    pub line: usize,
    pub reason: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub rows_imported: usize,
    pub rows_failed: usize,
    pub errors: Vec<ImportRowError>,
}

fn invalid<T>(reason: String) -> SyncResult<T> {
    Err(CatalogError::Validation { reason }.into())
}

fn parse_header(line: &str) -> SyncResult<Vec<String>> {
    let (schema, _) = Format::default()
        .with_header(true)
        .infer_schema(Cursor::new(line.as_bytes()), Some(1))
        .or_else(|e| invalid(format!("Could not parse the CSV header: {e}")))?;

    Ok(schema
        .fields()
        .iter()
        .map(|f| f.name().trim().to_string())
        .collect())
}

fn parse_record(schema: &SchemaRef, line: &str) -> Result<Vec<Option<String>>, String> {
    let mut reader = ReaderBuilder::new(schema.clone())
        .with_header(false)
        .build(Cursor::new(line.as_bytes()))
        .map_err(|e| format!("could not parse record: {e}"))?;

    let batch = match reader.next() {
        Some(batch) => batch.map_err(|e| format!("could not parse record: {e}"))?,
        None => return Err("could not parse record: no fields found".to_string()),
    };

    batch
        .columns()
        .iter()
        .map(|column| {
            let strings = column
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| "could not parse record: unexpected field type".to_string())?;
            Ok(if strings.is_null(0) || strings.value(0).is_empty() {
                None
            } else {
                Some(strings.value(0).to_string())
            })
        })
        .collect()
}

impl SchemaSynchronizer {
    /// Import CSV text into a table. The first line names the columns; it must
    /// only name known columns and must include every required one.
    pub async fn import_csv(&self, table_id: TableId, text: &str) -> SyncResult<ImportReport> {
        let table = self.tables.get(table_id).await?;

        let mut lines = text
            .lines()
            .enumerate()
            .map(|(ix, line)| (ix + 1, line.trim_end_matches('\r')))
            .filter(|(_, line)| !line.trim().is_empty());

        let header = match lines.next() {
            Some((_, line)) => parse_header(line)?,
            None => return invalid("The CSV data has no header line".to_string()),
        };

        let mut seen = HashSet::new();
        for name in &header {
            if !seen.insert(name.as_str()) {
                return invalid(format!("Column {name:?} appears more than once in the CSV header"));
            }
            if !table.materialized_columns().any(|c| &c.name == name) {
                return invalid(format!(
                    "Column {name:?} in the CSV header doesn't exist in table {:?}",
                    table.name
                ));
            }
        }
        if let Some(missing) = table
            .materialized_columns()
            .find(|c| c.required && !seen.contains(c.name.as_str()))
        {
            return invalid(format!(
                "Required column {:?} is missing from the CSV header",
                missing.name
            ));
        }

        let schema: SchemaRef = Arc::new(Schema::new(
            header
                .iter()
                .map(|name| Field::new(name, DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ));

        let mut report = ImportReport::default();
        for (line_number, line) in lines {
            let result = match parse_record(&schema, line) {
                Ok(fields) => {
                    let row: Map<String, Value> = header
                        .iter()
                        .cloned()
                        .zip(fields.into_iter().map(|f| f.map_or(Value::Null, Value::String)))
                        .collect();
                    self.insert_rows(&table.name, vec![row])
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
                Err(reason) => Err(reason),
            };

            match result {
                Ok(()) => report.rows_imported += 1,
                Err(reason) => {
                    debug!("Skipping line {line_number} of the import into {:?}: {reason}", table.name);
                    report.rows_failed += 1;
                    report.errors.push(ImportRowError {
                        line: line_number,
                        reason,
                    });
                }
            }
        }

        info!(
            "Imported {} row(s) into table {:?}, {} failed",
            report.rows_imported, table.name, report.rows_failed
        );
        Ok(report)
    }
}
