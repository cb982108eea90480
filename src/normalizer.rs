//! Canonicalises free-text fields, regions, and units on an `InputRow`
//! (C1). Pure functions, no side effects — run on every row rather than
//! only at CSV-load time.

use crate::error::{LcaError, Result};
use crate::models::InputRow;
use std::collections::HashMap;

/// Lowercase, trim, and transliterate German umlauts/eszett.
pub fn normalize_text(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .replace('ä', "a")
        .replace('ö', "o")
        .replace('ü', "u")
        .replace('ß', "ss")
}

fn region_alias_table() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("europa", "RER"),
        ("europe", "RER"),
        ("deutschland", "DE"),
        ("germany", "DE"),
        ("osterreich", "AT"),
        ("austria", "AT"),
        ("schweiz", "CH"),
        ("switzerland", "CH"),
        ("frankreich", "FR"),
        ("france", "FR"),
        ("weltweit", "GLO"),
        ("global", "GLO"),
        ("rest der welt", "RoW"),
        ("rest of world", "RoW"),
    ])
}

/// Resolve a free-text region to a catalogue geography code. Unknown
/// values pass through unchanged; an empty value defaults to `GLO`.
pub fn normalize_region(region: Option<&str>) -> String {
    let raw = region.unwrap_or("").trim();
    if raw.is_empty() {
        return "GLO".to_string();
    }
    let key = normalize_text(raw);
    region_alias_table()
        .get(key.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| raw.to_string())
}

fn unit_table() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("stuck", "unit"),
        ("stück", "unit"),
        ("stk", "unit"),
        ("liter", "l"),
        ("l", "l"),
        ("kilogramm", "kg"),
        ("kg", "kg"),
        ("kilowattstunde", "kWh"),
        ("kwh", "kWh"),
        ("quadratmeter", "m2"),
        ("m2", "m2"),
        ("kubikmeter", "m3"),
        ("m3", "m3"),
        ("kilometer", "km"),
        ("km", "km"),
        ("hektar", "ha"),
        ("ha", "ha"),
        ("stunde", "hour"),
        ("stunden", "hour"),
        ("h", "hour"),
        ("megajoule", "MJ"),
        ("mj", "MJ"),
        ("tonne", "t"),
        ("tonnen", "t"),
        ("t", "t"),
        ("gramm", "g"),
        ("g", "g"),
        ("kg km", "kg·km"),
        ("kg·km", "kg·km"),
        ("t km", "t·km"),
        ("t·km", "t·km"),
        ("tkm", "t·km"),
    ])
}

/// Resolve a free-text unit string to its canonical catalogue unit.
/// Fails with `UnknownUnit` when no mapping exists.
pub fn normalize_unit(unit: &str) -> Result<String> {
    let key = normalize_text(unit);
    unit_table()
        .get(key.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| LcaError::UnknownUnit(unit.to_string()))
}

/// Populate the `*_norm` shadow fields on a row in place.
pub fn normalize_row(row: &mut InputRow) -> Result<()> {
    row.bezeichnung_norm = Some(normalize_text(&row.bezeichnung));
    row.produktinfo_norm = row.produktinformationen.as_deref().map(normalize_text);
    row.region_norm = Some(normalize_region(row.region.as_deref()));
    row.unit_norm = Some(normalize_unit(&row.referenzeinheit)?);
    Ok(())
}
