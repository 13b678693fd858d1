//! Row normalization for spreadsheet documents.
//!
//! The first grid row is treated as the header. Cleaning order matches the
//! upstream reporting exports: drop all-blank rows, drop all-blank columns,
//! drop duplicate rows, then serialize each remaining row as
//! `"col: val, col: val"`, skipping empty, `nan` and `None` cells. A column
//! with data under a blank header cell is kept and labeled `Unnamed: N`,
//! the name the exports synthesize for it.

use std::collections::HashSet;

fn is_blank(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == "nan" || trimmed == "None"
}

/// Serialize a cell grid into one string per meaningful row.
pub fn serialize_rows(grid: Vec<Vec<String>>) -> Vec<String> {
    let mut rows = grid.into_iter();
    let Some(header) = rows.next() else {
        return Vec::new();
    };

    let data: Vec<Vec<String>> = rows
        .filter(|row| row.iter().any(|cell| !is_blank(cell)))
        .collect();

    // A column survives when at least one data cell is non-blank; the
    // header label does not decide.
    let kept_columns: Vec<usize> = (0..header.len())
        .filter(|&col| {
            data.iter()
                .any(|row| row.get(col).map(|cell| !is_blank(cell)).unwrap_or(false))
        })
        .collect();

    let labels: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(col, cell)| {
            if is_blank(cell) {
                format!("Unnamed: {col}")
            } else {
                cell.trim().to_string()
            }
        })
        .collect();

    let mut seen = HashSet::new();
    let mut serialized = Vec::new();

    for row in data {
        let parts: Vec<String> = kept_columns
            .iter()
            .filter_map(|&col| {
                let value = row.get(col).map(String::as_str).unwrap_or("");
                if is_blank(value) {
                    None
                } else {
                    Some(format!("{}: {}", labels[col], value.trim()))
                }
            })
            .collect();

        if parts.is_empty() {
            continue;
        }
        let line = parts.join(", ");
        if seen.insert(line.clone()) {
            serialized.push(line);
        }
    }

    serialized
}
