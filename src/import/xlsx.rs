use super::{ImportError, ImportResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use zip::ZipArchive;

const MAX_PART_BYTES: u64 = 64 * 1024 * 1024;
const FALLBACK_SHEET: &str = "xl/worksheets/sheet1.xml";

/// A sheet row: its 1-based row number and the cells left to right.
pub type SheetRow = (usize, Vec<String>);

pub fn is_xlsx(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04")
}

/// Shared, inline, numeric and boolean cells of the first worksheet. Styles and dates are ignored.
pub fn read_first_sheet(bytes: &[u8]) -> ImportResult<Vec<SheetRow>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| malformed(format!("not a readable workbook: {e}")))?;

    let sheet_path = first_sheet_path(&mut archive).unwrap_or_else(|| FALLBACK_SHEET.to_string());
    let shared = match read_part(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let Some(sheet_xml) = read_part(&mut archive, &sheet_path)? else {
        return Err(malformed(format!("workbook has no worksheet at {sheet_path}")));
    };
    parse_sheet(&sheet_xml, &shared)
}

fn malformed(msg: String) -> ImportError {
    ImportError::MalformedFile(msg)
}

fn read_part(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> ImportResult<Option<String>> {
    let mut file = match archive.by_name(name) {
        Ok(f) => f,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(malformed(format!("cannot open {name}: {e}"))),
    };
    if file.size() > MAX_PART_BYTES {
        return Err(malformed(format!("{name} is too large")));
    }
    let mut out = String::new();
    (&mut file)
        .take(MAX_PART_BYTES)
        .read_to_string(&mut out)
        .map_err(|e| malformed(format!("cannot read {name}: {e}")))?;
    Ok(Some(out))
}

fn first_sheet_path(archive: &mut ZipArchive<Cursor<&[u8]>>) -> Option<String> {
    let workbook = read_part(archive, "xl/workbook.xml").ok()??;
    let rels = read_part(archive, "xl/_rels/workbook.xml.rels").ok()??;

    let rel_id = find_element(&workbook, b"sheet", |_| true)
        .and_then(|attrs| attrs.get("id").cloned())?;
    let target = find_element(&rels, b"Relationship", |attrs| {
        attrs.get("Id") == Some(&rel_id)
    })
    .and_then(|attrs| attrs.get("Target").cloned())?;
    Some(match target.strip_prefix('/') {
        Some(abs) => abs.to_string(),
        None => format!("xl/{}", target),
    })
}

/// Attributes of the first `name` element accepted by `keep`, keyed by local name.
fn find_element(
    xml: &str,
    name: &[u8],
    keep: impl Fn(&BTreeMap<String, String>) -> bool,
) -> Option<BTreeMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event().ok()? {
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == name => {
                let attrs = attributes(e);
                if keep(&attrs) {
                    return Some(attrs);
                }
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

fn attributes(e: &BytesStart) -> BTreeMap<String, String> {
    e.attributes()
        .flatten()
        .filter_map(|a| {
            let key = String::from_utf8_lossy(a.key.local_name().as_ref()).to_string();
            let value = a.unescape_value().ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

fn attr(e: &BytesStart, name: &str) -> Option<String> {
    attributes(e).remove(name)
}

fn xml_error(e: impl std::fmt::Display) -> ImportError {
    malformed(format!("invalid workbook xml: {e}"))
}

fn parse_shared_strings(xml: &str) -> ImportResult<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    // Phonetic hints repeat the text in another script; skip them.
    let mut phonetic = 0usize;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => phonetic += 1,
                b"t" => in_text = phonetic == 0,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => out.push(String::new()),
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => out.push(current.take().unwrap_or_default()),
                b"rPh" => phonetic = phonetic.saturating_sub(1),
                b"t" => in_text = false,
                _ => {}
            },
            Event::Text(e) if in_text => {
                let text = e.unescape().map_err(xml_error)?;
                if let Some(buf) = current.as_mut() {
                    buf.push_str(&text);
                }
            }
            Event::CData(e) if in_text => {
                if let Some(buf) = current.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn parse_sheet(xml: &str, shared: &[String]) -> ImportResult<Vec<SheetRow>> {
    let mut reader = Reader::from_str(xml);
    let mut rows = Vec::new();
    let mut row_no = 0usize;
    let mut cells: BTreeMap<usize, String> = BTreeMap::new();
    let mut next_col = 0usize;

    let mut cell_col = 0usize;
    let mut cell_type = String::new();
    let mut cell_value: Option<String> = None;
    let mut inline = String::new();
    let mut in_value = false;
    let mut in_text = false;

    loop {
        let event = reader.read_event().map_err(xml_error)?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                match e.local_name().as_ref() {
                    b"row" => {
                        row_no = attr(e, "r")
                            .and_then(|r| r.parse::<usize>().ok())
                            .unwrap_or(row_no + 1);
                        cells.clear();
                        next_col = 0;
                        if empty {
                            rows.push((row_no, Vec::new()));
                        }
                    }
                    b"c" => {
                        cell_col = match attr(e, "r") {
                            Some(r) => column_index(&r)
                                .ok_or_else(|| malformed(format!("bad cell reference {r}")))?,
                            None => next_col,
                        };
                        next_col = cell_col + 1;
                        cell_type = attr(e, "t").unwrap_or_else(|| "n".to_string());
                        cell_value = None;
                        inline.clear();
                        if empty {
                            cells.insert(cell_col, String::new());
                        }
                    }
                    b"v" if !empty => {
                        in_value = true;
                        cell_value = Some(String::new());
                    }
                    b"t" if !empty => in_text = true,
                    _ => {}
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"row" => {
                    rows.push((row_no, dense(&cells)));
                    cells.clear();
                }
                b"c" => {
                    let value = match cell_type.as_str() {
                        "s" => {
                            let idx = cell_value
                                .as_deref()
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .ok_or_else(|| malformed("bad shared string index".to_string()))?;
                            shared
                                .get(idx)
                                .cloned()
                                .ok_or_else(|| malformed(format!("missing shared string {idx}")))?
                        }
                        "inlineStr" => inline.clone(),
                        _ => cell_value.take().unwrap_or_default(),
                    };
                    cells.insert(cell_col, value);
                }
                b"v" => in_value = false,
                b"t" => in_text = false,
                _ => {}
            },
            Event::Text(ref e) if in_value || in_text => {
                let text = e.unescape().map_err(xml_error)?;
                push_cell_text(in_value, &mut cell_value, &mut inline, &text);
            }
            Event::CData(ref e) if in_value || in_text => {
                let text = String::from_utf8_lossy(e);
                push_cell_text(in_value, &mut cell_value, &mut inline, &text);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rows)
}

fn push_cell_text(in_value: bool, value: &mut Option<String>, inline: &mut String, text: &str) {
    if in_value {
        value.get_or_insert_with(String::new).push_str(text);
    } else {
        inline.push_str(text);
    }
}

fn dense(cells: &BTreeMap<usize, String>) -> Vec<String> {
    let Some((&last, _)) = cells.iter().next_back() else {
        return Vec::new();
    };
    (0..=last)
        .map(|i| cells.get(&i).cloned().unwrap_or_default())
        .collect()
}

/// `"AB12"` -> 27 (zero-based column).
fn column_index(reference: &str) -> Option<usize> {
    let letters = reference
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>();
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut n = 0usize;
    for ch in letters.chars() {
        n = n * 26 + (ch.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(n - 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    /// Builds a one-sheet workbook using shared strings for every non-empty cell.
    pub(crate) fn build_xlsx(rows: &[Vec<&str>]) -> Vec<u8> {
        let mut shared: Vec<String> = Vec::new();
        let mut sheet = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData>",
        );
        for (r, row) in rows.iter().enumerate() {
            sheet.push_str(&format!("<row r=\"{}\">", r + 1));
            for (c, value) in row.iter().enumerate() {
                if value.is_empty() {
                    continue;
                }
                let col = (b'A' + c as u8) as char;
                shared.push(value.replace('&', "&amp;").replace('<', "&lt;"));
                sheet.push_str(&format!(
                    "<c r=\"{}{}\" t=\"s\"><v>{}</v></c>",
                    col,
                    r + 1,
                    shared.len() - 1
                ));
            }
            sheet.push_str("</row>");
        }
        sheet.push_str("</sheetData></worksheet>");
        let mut sst = String::from("<?xml version=\"1.0\"?><sst>");
        for s in &shared {
            sst.push_str(&format!("<si><t>{}</t></si>", s));
        }
        sst.push_str("</sst>");

        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
            zip.start_file("xl/workbook.xml", opts).expect("start workbook");
            zip.write_all(b"<workbook><sheets><sheet name=\"Sheet1\" sheetId=\"1\" r:id=\"rId1\"/></sheets></workbook>")
                .expect("write workbook");
            zip.start_file("xl/_rels/workbook.xml.rels", opts).expect("start rels");
            zip.write_all(b"<Relationships><Relationship Id=\"rId1\" Target=\"worksheets/data.xml\"/></Relationships>")
                .expect("write rels");
            zip.start_file("xl/sharedStrings.xml", opts).expect("start sst");
            zip.write_all(sst.as_bytes()).expect("write sst");
            zip.start_file("xl/worksheets/data.xml", opts).expect("start sheet");
            zip.write_all(sheet.as_bytes()).expect("write sheet");
            zip.finish().expect("finish zip");
        }
        buf.into_inner()
    }

    #[test]
    fn reads_shared_strings_through_workbook_relationships() {
        let bytes = build_xlsx(&[
            vec!["Title", "First name", "Last name", "Email"],
            vec!["Dr.", "Jane", "Doe & Co", "jane@x.edu"],
            vec!["", "Max", "Muster", "max@x.edu"],
        ]);
        assert!(is_xlsx(&bytes));
        let rows = read_first_sheet(&bytes).expect("read sheet");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].0, 2);
        assert_eq!(rows[1].1, vec!["Dr.", "Jane", "Doe & Co", "jane@x.edu"]);
        assert_eq!(rows[2].1, vec!["", "Max", "Muster", "max@x.edu"]);
    }

    #[test]
    fn parses_inline_numeric_and_prefixed_cells() {
        let xml = r#"<x:worksheet><x:sheetData>
            <x:row r="1"><x:c r="A1" t="inlineStr"><x:is><x:t>Name</x:t></x:is></x:c><x:c r="C1"><x:v>42</x:v></x:c></x:row>
            <x:row r="3"><x:c r="B3" t="b"><x:v>1</x:v></x:c><x:c r="D3" s="2"/></x:row>
        </x:sheetData></x:worksheet>"#;
        let rows = parse_sheet(xml, &[]).expect("parse");
        assert_eq!(rows[0], (1, vec!["Name".to_string(), String::new(), "42".to_string()]));
        assert_eq!(rows[1].0, 3);
        assert_eq!(rows[1].1, vec!["", "1", "", ""]);
    }

    #[test]
    fn shared_strings_join_rich_text_runs() {
        let xml = r#"<sst><si><r><t>Intro</t></r><r><t xml:space="preserve"> to CS</t></r><rPh><t>x</t></rPh></si><si/></sst>"#;
        assert_eq!(
            parse_shared_strings(xml).expect("parse"),
            vec!["Intro to CS".to_string(), String::new()]
        );
    }

    #[test]
    fn shared_strings_decode_entities_and_cdata() {
        let xml = r#"<sst><si><t><![CDATA[Müller & <Söhne>]]></t></si><si><t>M&#252;ller &amp; S&#xF6;hne</t></si></sst>"#;
        assert_eq!(
            parse_shared_strings(xml).expect("parse"),
            vec!["Müller & <Söhne>".to_string(), "Müller & Söhne".to_string()]
        );
    }

    #[test]
    fn broken_xml_is_malformed() {
        let err = parse_sheet("<worksheet><sheetData><row></sheetData>", &[]).expect_err("must fail");
        assert!(matches!(err, ImportError::MalformedFile(_)));
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("Z9"), Some(25));
        assert_eq!(column_index("AB12"), Some(27));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = read_first_sheet(b"PK\x03\x04not really a zip").expect_err("must fail");
        assert!(matches!(err, ImportError::MalformedFile(_)));
    }
}
