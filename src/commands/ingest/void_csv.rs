use std::io::Read;

use csv::{ReaderBuilder, StringRecord, Trim};

use crate::model::{MeasurementRecord, VOID_RESULT_COLUMNS};

use super::ExtractError;

const FORMAT: &str = "csv";

/// Reads a void result table and maps it onto [`VOID_RESULT_COLUMNS`].
///
/// Schema columns missing from the header come back as `None`, as do empty
/// cells and cells past the end of a short row. Extra columns are dropped.
pub(crate) fn extract_measurement_records<R: Read>(
    reader: R,
    source_filename: &str,
) -> Result<Vec<MeasurementRecord>, ExtractError> {
    let mut csv_reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::Headers)
        .from_reader(reader);

    let headers = csv_reader
        .headers()
        .map_err(|err| ExtractError::malformed(FORMAT, err))?
        .clone();
    if headers.iter().all(|header| header.is_empty()) {
        return Err(ExtractError::malformed(FORMAT, "missing header row"));
    }

    let positions = column_positions(&headers);

    let mut records = Vec::new();
    for row in csv_reader.records() {
        let row = row.map_err(|err| ExtractError::malformed(FORMAT, err))?;
        let values = std::array::from_fn(|column| {
            positions[column]
                .and_then(|index| row.get(index))
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
        });
        records.push(MeasurementRecord::from_columns(
            values,
            source_filename.to_string(),
        ));
    }

    if records.is_empty() {
        return Err(ExtractError::Empty);
    }

    Ok(records)
}

fn column_positions(headers: &StringRecord) -> [Option<usize>; 15] {
    std::array::from_fn(|column| {
        headers
            .iter()
            .position(|header| header.trim_start_matches('\u{feff}') == VOID_RESULT_COLUMNS[column])
    })
}
