use serde::Deserialize;

use crate::model::LotRecord;

use super::ExtractError;

const FORMAT: &str = "lotx";

#[derive(Debug, Deserialize)]
struct LotDocument {
    #[serde(rename = "@Id", default)]
    id: Option<String>,
    #[serde(rename = "@Recipe", default)]
    recipe: Option<String>,
    #[serde(rename = "@AllowSizeNull", default)]
    allow_size_null: Option<String>,
    #[serde(rename = "@CountUniqueBarcodesOnly", default)]
    count_unique_barcodes_only: Option<String>,
    #[serde(rename = "@Size", default)]
    size: Option<String>,
    #[serde(rename = "@CarrierIndex", default)]
    carrier_index: Option<String>,
    #[serde(rename = "Trays", default)]
    trays: Option<TrayList>,
}

#[derive(Debug, Default, Deserialize)]
struct TrayList {
    #[serde(rename = "Tray", default)]
    trays: Vec<TrayElement>,
}

#[derive(Debug, Deserialize)]
struct TrayElement {
    #[serde(rename = "@Id", default)]
    id: Option<String>,
    #[serde(rename = "@State", default)]
    state: Option<String>,
    #[serde(rename = "@Code", default)]
    code: Option<String>,
    #[serde(rename = "Units", default)]
    units: Option<UnitList>,
}

#[derive(Debug, Default, Deserialize)]
struct UnitList {
    #[serde(rename = "Unit", default)]
    units: Vec<UnitElement>,
}

#[derive(Debug, Deserialize)]
struct UnitElement {
    #[serde(rename = "@Id", default)]
    id: Option<String>,
    #[serde(rename = "@State", default)]
    state: Option<String>,
    #[serde(rename = "@Code", default)]
    code: Option<String>,
    #[serde(rename = "@Idx", default)]
    idx: Option<String>,
}

/// Flattens a lot export into one record per unit.
///
/// Numeric attributes default to 0 when absent; a present but non-integer
/// value makes the whole document malformed.
pub(crate) fn extract_lot_records(
    content: &str,
    source_filename: &str,
) -> Result<Vec<LotRecord>, ExtractError> {
    let content = content.trim_start_matches('\u{feff}');
    let document: LotDocument =
        quick_xml::de::from_str(content).map_err(|err| ExtractError::malformed(FORMAT, err))?;

    let size = parse_int_attr("Size", document.size.as_deref())?;
    let carrier_index = parse_int_attr("CarrierIndex", document.carrier_index.as_deref())?;

    let mut records = Vec::new();
    for tray in document.trays.unwrap_or_default().trays {
        let tray_state = parse_int_attr("Tray/@State", tray.state.as_deref())?;
        for unit in tray.units.unwrap_or_default().units {
            records.push(LotRecord {
                lot_id: document.id.clone(),
                recipe: document.recipe.clone(),
                allow_size_null: document.allow_size_null.clone(),
                count_unique_barcodes_only: document.count_unique_barcodes_only.clone(),
                size,
                carrier_index,
                tray_id: tray.id.clone(),
                tray_state,
                tray_code: tray.code.clone(),
                unit_id: unit.id,
                unit_state: parse_int_attr("Unit/@State", unit.state.as_deref())?,
                unit_code: unit.code,
                unit_idx: parse_int_attr("Unit/@Idx", unit.idx.as_deref())?,
                source_filename: source_filename.to_string(),
            });
        }
    }

    if records.is_empty() {
        return Err(ExtractError::Empty);
    }

    Ok(records)
}

fn parse_int_attr(name: &str, value: Option<&str>) -> Result<i64, ExtractError> {
    let Some(raw) = value else {
        return Ok(0);
    };

    raw.trim().parse::<i64>().map_err(|_| {
        ExtractError::malformed(FORMAT, format!("attribute {name}={raw:?} is not an integer"))
    })
}
