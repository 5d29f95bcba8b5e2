//! Per-entry files and AFLUX help, fetched outside the paged query flow.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AflowError;
use crate::http::{HttpTransport, fetch};
use crate::materialize::{Record, Value as FieldValue};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KeywordHelp {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "__comment__")]
    pub comment: Vec<String>,
}

/// General AFLUX help, or the entry for one keyword.
pub fn help(transport: &HttpTransport, keyword: Option<&str>) -> Result<String> {
    let Some(keyword) = keyword else {
        let text = fetch(transport, transport.url())?;
        return Ok(match serde_json::from_str::<Vec<String>>(&text) {
            Ok(lines) => lines.join("\n"),
            Err(_) => text,
        });
    };

    if keyword.is_empty() || !keyword.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(anyhow!("invalid keyword `{}`", keyword));
    }

    let url = format!("{}help({})", transport.url(), keyword);
    let text = fetch(transport, &url)?;
    let mut entries: serde_json::Map<String, Value> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse help for `{}`", keyword))?;
    let entry = entries
        .remove(keyword)
        .ok_or_else(|| anyhow!("no help information found for keyword `{}`", keyword))?;
    let entry: KeywordHelp = serde_json::from_value(entry)
        .with_context(|| format!("unexpected help layout for `{}`", keyword))?;

    Ok(render_help(keyword, &entry))
}

fn render_help(keyword: &str, entry: &KeywordHelp) -> String {
    let mut out = format!(
        "{}:\n  description: {}\n  units: {}\n  status: {}\n",
        keyword, entry.description, entry.units, entry.status
    );
    let comment = entry.comment.join("\n    ");
    let comment = comment.trim();
    if !comment.is_empty() {
        out.push_str(&format!("  comment:\n    {}", comment));
    }
    out
}

/// `host:path` as stored in AFLOW becomes `http://host/path`.
fn entry_url(record: &Record) -> Result<String, AflowError> {
    let aurl = record.string("aurl").ok_or(AflowError::MissingEntryUrl)?;
    Ok(format!("http://{}", aurl.replacen(':', "/", 1)))
}

/// Relaxed structure (`CONTCAR.relax`) of the entry, in POSCAR layout.
///
/// Files written in the VASP4 layout lack the species line; it is filled in
/// from the record's `species` when selected.
pub fn structure(transport: &HttpTransport, record: &Record) -> Result<String> {
    let url = format!("{}/CONTCAR.relax", entry_url(record)?);
    let text = fetch(transport, &url)?;
    Ok(fix_species_line(&text, record))
}

fn fix_species_line(poscar: &str, record: &Record) -> String {
    let species = record
        .value("species")
        .and_then(FieldValue::as_list)
        .map(|items| {
            items
                .iter()
                .filter_map(FieldValue::as_str)
                .collect::<Vec<_>>()
                .join(" ")
        });

    let mut lines = poscar.split('\n').collect::<Vec<_>>();
    let vasp4 = lines
        .get(5)
        .and_then(|l| l.trim().chars().next())
        .is_some_and(|c| c.is_ascii_digit());

    match species {
        Some(line) if vasp4 => {
            lines.insert(5, &line);
            lines.join("\n")
        }
        _ => poscar.to_string(),
    }
}

/// A property file of the entry, split on `;`.
pub fn entry_property(transport: &HttpTransport, record: &Record, name: &str) -> Result<Vec<String>> {
    let url = format!("{}/?{}", entry_url(record)?, name);
    let text = fetch(transport, &url)?;
    Ok(text.trim().split(';').map(|v| v.trim().to_string()).collect())
}
