//! Text and grid extraction for OOXML containers (DOCX, PPTX, XLSX).
//!
//! All three formats are ZIP archives of XML parts. Extraction walks the XML
//! with a streaming reader and never materializes the DOM. Entry sizes are
//! bounded as zip-bomb protection.

use std::io::Read;

use super::DecodeError;

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum cells processed per worksheet.
const XLSX_MAX_CELLS: usize = 200_000;

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, DecodeError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|err| DecodeError::Ooxml(err.to_string()))
}

fn read_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, DecodeError> {
    let entry = archive
        .by_name(name)
        .map_err(|err| DecodeError::Ooxml(format!("{name}: {err}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|err| DecodeError::Ooxml(err.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(DecodeError::Ooxml(format!(
            "ZIP entry {name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        )));
    }
    Ok(out)
}

/// Extract paragraph text from a DOCX document, one line per paragraph.
pub(crate) fn extract_docx(bytes: &[u8]) -> Result<String, DecodeError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry_bounded(&mut archive, "word/document.xml")?;

    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut paragraph = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"p" => paragraph.clear(),
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                paragraph.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    out.push_str(&paragraph);
                    out.push('\n');
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(err) => return Err(DecodeError::Ooxml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

/// Extract slide text from a PPTX deck, one line per text run, slides in order.
pub(crate) fn extract_pptx(bytes: &[u8]) -> Result<String, DecodeError> {
    let mut archive = open_archive(bytes)?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
        .map(|name| name.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out = String::new();
    for name in slide_names {
        let xml = read_entry_bounded(&mut archive, &name)?;
        extract_a_t_lines(&xml, &mut out)?;
    }
    Ok(out)
}

fn extract_a_t_lines(xml: &[u8], out: &mut String) -> Result<(), DecodeError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
                out.push('\n');
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(err) => return Err(DecodeError::Ooxml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// Extract the first worksheet of an XLSX workbook as a cell grid.
///
/// Shared strings, inline strings and raw values are all resolved; rows are
/// padded to a uniform width so the tabular serializer can pair values with
/// header labels by position.
pub(crate) fn extract_xlsx_grid(bytes: &[u8]) -> Result<Vec<Vec<String>>, DecodeError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = match read_entry_bounded(&mut archive, "xl/sharedStrings.xml") {
        Ok(xml) => parse_shared_strings(&xml)?,
        // Workbooks without string cells omit the part entirely.
        Err(_) => Vec::new(),
    };

    let sheet_name = first_sheet_name(&mut archive)?;
    let xml = read_entry_bounded(&mut archive, &sheet_name)?;
    let mut grid = parse_sheet_grid(&xml, &shared_strings)?;

    let width = grid.iter().map(Vec::len).max().unwrap_or(0);
    for row in &mut grid {
        row.resize(width, String::new());
    }
    Ok(grid)
}

fn first_sheet_name(archive: &mut Archive<'_>) -> Result<String, DecodeError> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("xl/worksheets/sheet") && name.ends_with(".xml"))
        .map(|name| name.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
        .into_iter()
        .next()
        .ok_or_else(|| DecodeError::Ooxml("workbook contains no worksheets".into()))
}

fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>, DecodeError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_text = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => {
                    strings.push(current.clone());
                    in_si = false;
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(err) => return Err(DecodeError::Ooxml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    InlineOrValue,
}

fn parse_sheet_grid(
    xml: &[u8],
    shared_strings: &[String],
) -> Result<Vec<Vec<String>>, DecodeError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut grid: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_kind = CellKind::InlineOrValue;
    let mut cell_column: Option<usize> = None;
    let mut in_value = false;
    let mut in_row = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = true;
                    row.clear();
                }
                b"c" if in_row => {
                    cell_kind = CellKind::InlineOrValue;
                    cell_column = None;
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"t" if attr.value.as_ref() == b"s" => cell_kind = CellKind::Shared,
                            b"r" => {
                                cell_column = column_index(&attr.value);
                            }
                            _ => {}
                        }
                    }
                }
                b"v" | b"t" if in_row => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = match cell_kind {
                    CellKind::Shared => raw
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .and_then(|idx| shared_strings.get(idx))
                        .cloned()
                        .unwrap_or_default(),
                    CellKind::InlineOrValue => normalize_numeric(raw.as_ref()),
                };
                let column = cell_column.unwrap_or(row.len());
                if column >= row.len() {
                    row.resize(column + 1, String::new());
                }
                row[column] = value;
                cell_count += 1;
                in_value = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"row" => {
                    grid.push(row.clone());
                    in_row = false;
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(err) => return Err(DecodeError::Ooxml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(grid)
}

/// Render numeric cell values without a trailing `.0`.
fn normalize_numeric(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<f64>()
        && value.fract() == 0.0
        && value.abs() < 1e15
    {
        return format!("{}", value as i64);
    }
    trimmed.to_string()
}

/// Column index of an `A1`-style cell reference (`A` -> 0, `AB` -> 27).
fn column_index(reference: &[u8]) -> Option<usize> {
    let mut index = 0usize;
    let mut seen_letter = false;
    for byte in reference {
        let upper = byte.to_ascii_uppercase();
        if upper.is_ascii_uppercase() {
            index = index * 26 + (upper - b'A' + 1) as usize;
            seen_letter = true;
        } else {
            break;
        }
    }
    seen_letter.then(|| index - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_xlsx(shared: &[&str], sheet_xml: &str) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = SimpleFileOptions::default();
            if !shared.is_empty() {
                let items: String = shared
                    .iter()
                    .map(|s| format!("<si><t>{s}</t></si>"))
                    .collect();
                writer
                    .start_file("xl/sharedStrings.xml", options)
                    .expect("start shared strings");
                writer
                    .write_all(format!("<sst>{items}</sst>").as_bytes())
                    .expect("write shared strings");
            }
            writer
                .start_file("xl/worksheets/sheet1.xml", options)
                .expect("start sheet");
            writer
                .write_all(format!("<worksheet><sheetData>{sheet_xml}</sheetData></worksheet>").as_bytes())
                .expect("write sheet");
            writer.finish().expect("finish zip");
        }
        cursor.into_inner()
    }

    fn build_docx(document_xml: &str) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            writer
                .start_file("word/document.xml", SimpleFileOptions::default())
                .expect("start document");
            writer
                .write_all(document_xml.as_bytes())
                .expect("write document");
            writer.finish().expect("finish zip");
        }
        cursor.into_inner()
    }

    #[test]
    fn column_index_decodes_references() {
        assert_eq!(column_index(b"A1"), Some(0));
        assert_eq!(column_index(b"B2"), Some(1));
        assert_eq!(column_index(b"AB10"), Some(27));
        assert_eq!(column_index(b"10"), None);
    }

    #[test]
    fn numeric_values_lose_trailing_zero() {
        assert_eq!(normalize_numeric("42.0"), "42");
        assert_eq!(normalize_numeric("3.25"), "3.25");
        assert_eq!(normalize_numeric("hello"), "hello");
    }

    #[test]
    fn docx_paragraphs_join_with_newlines() {
        let bytes = build_docx(
            "<w:document xmlns:w=\"ns\"><w:body>\
             <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>\
             <w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph.</w:t></w:r></w:p>\
             </w:body></w:document>",
        );
        let text = extract_docx(&bytes).expect("docx text");
        assert_eq!(text, "First paragraph.\nSecond paragraph.\n");
    }

    #[test]
    fn xlsx_grid_resolves_shared_and_raw_cells() {
        let bytes = build_xlsx(
            &["Name", "Count", "Ana"],
            "<row r=\"1\"><c r=\"A1\" t=\"s\"><v>0</v></c><c r=\"B1\" t=\"s\"><v>1</v></c></row>\
             <row r=\"2\"><c r=\"A2\" t=\"s\"><v>2</v></c><c r=\"B2\"><v>42.0</v></c></row>",
        );
        let grid = extract_xlsx_grid(&bytes).expect("grid");
        assert_eq!(
            grid,
            vec![
                vec!["Name".to_string(), "Count".to_string()],
                vec!["Ana".to_string(), "42".to_string()],
            ]
        );
    }

    #[test]
    fn xlsx_grid_pads_sparse_rows() {
        let bytes = build_xlsx(
            &["a", "b", "c"],
            "<row r=\"1\"><c r=\"A1\" t=\"s\"><v>0</v></c><c r=\"C1\" t=\"s\"><v>2</v></c></row>\
             <row r=\"2\"><c r=\"A2\" t=\"s\"><v>1</v></c></row>",
        );
        let grid = extract_xlsx_grid(&bytes).expect("grid");
        assert_eq!(grid[0], vec!["a", "", "c"]);
        assert_eq!(grid[1], vec!["b", "", ""]);
    }
}
