use calamine::{Data, Reader, Xls, Xlsx};
use std::io::Cursor;
use thiserror::Error;

pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_ROWS: usize = 50_000;

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const OLE2_MAGIC: [u8; 8] = [0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("{0}")]
    FileTooLarge(String),
    #[error("malformed file: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub fn code(&self) -> &'static str {
        match self {
            DecodeError::UnsupportedFormat(_) => "unsupported_format",
            DecodeError::FileTooLarge(_) => "file_too_large",
            DecodeError::Malformed(_) => "malformed_file",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub max_file_size_bytes: u64,
    pub max_rows: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        DecodeLimits {
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

/// One data row of the source file. `source_row` is the zero-based index
/// among data rows (the header row is not counted). `cells` is aligned to
/// the decoded header list: short rows are padded, long rows truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub source_row: usize,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFile {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFormat {
    Csv { delimiter: u8 },
    Xlsx,
    Xls,
}

fn extension_of(file_name: &str) -> String {
    file_name
        .rsplit('.')
        .next()
        .filter(|ext| *ext != file_name)
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn detect_format(file_name: &str, bytes: &[u8]) -> Result<SourceFormat, DecodeError> {
    let has_zip_magic = bytes.starts_with(&ZIP_MAGIC);
    let has_ole2_magic = bytes.starts_with(&OLE2_MAGIC);
    match extension_of(file_name).as_str() {
        "csv" | "txt" => Ok(SourceFormat::Csv { delimiter: b',' }),
        "tsv" => Ok(SourceFormat::Csv { delimiter: b'\t' }),
        "xlsx" => Ok(SourceFormat::Xlsx),
        // Files renamed .xls are frequently OOXML underneath. Trust the
        // container magic over the extension.
        "xls" => {
            if has_zip_magic {
                Ok(SourceFormat::Xlsx)
            } else {
                Ok(SourceFormat::Xls)
            }
        }
        "" => {
            if has_zip_magic {
                Ok(SourceFormat::Xlsx)
            } else if has_ole2_magic {
                Ok(SourceFormat::Xls)
            } else {
                Err(DecodeError::UnsupportedFormat(
                    "file has no extension and no recognizable spreadsheet signature".to_string(),
                ))
            }
        }
        other => Err(DecodeError::UnsupportedFormat(format!(
            "unsupported extension .{other}; expected .csv, .xls or .xlsx"
        ))),
    }
}

fn is_blank_row(cells: &[String]) -> bool {
    cells.iter().all(|c| c.trim().is_empty())
}

fn align_to(width: usize, mut cells: Vec<String>) -> Vec<String> {
    cells.truncate(width);
    while cells.len() < width {
        cells.push(String::new());
    }
    cells
}

/// Decode an uploaded byte stream into a header row plus ordered data
/// rows. Row 0 of the source is the header; decoding stops at the first
/// fully-blank row. Pure transform: persists nothing, and the same bytes
/// always produce the same sequence.
pub fn decode(file_name: &str, bytes: &[u8], limits: &DecodeLimits) -> Result<DecodedFile, DecodeError> {
    if bytes.len() as u64 > limits.max_file_size_bytes {
        return Err(DecodeError::FileTooLarge(format!(
            "file is {} bytes, over the {}-byte ceiling",
            bytes.len(),
            limits.max_file_size_bytes
        )));
    }
    match detect_format(file_name, bytes)? {
        SourceFormat::Csv { delimiter } => decode_csv(bytes, delimiter, limits),
        SourceFormat::Xlsx => {
            let mut wb = Xlsx::new(Cursor::new(bytes))
                .map_err(|e| DecodeError::Malformed(format!("corrupt xlsx container: {e}")))?;
            let range = wb
                .worksheet_range_at(0)
                .ok_or_else(|| DecodeError::Malformed("workbook has no worksheets".to_string()))?
                .map_err(|e| DecodeError::Malformed(format!("corrupt worksheet: {e}")))?;
            decode_range(range, limits)
        }
        SourceFormat::Xls => {
            let mut wb = Xls::new(Cursor::new(bytes))
                .map_err(|e| DecodeError::Malformed(format!("corrupt xls file: {e}")))?;
            let range = wb
                .worksheet_range_at(0)
                .ok_or_else(|| DecodeError::Malformed("workbook has no worksheets".to_string()))?
                .map_err(|e| DecodeError::Malformed(format!("corrupt worksheet: {e}")))?;
            decode_range(range, limits)
        }
    }
}

fn decode_csv(bytes: &[u8], delimiter: u8, limits: &DecodeLimits) -> Result<DecodedFile, DecodeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);

    let mut headers: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let cells: Vec<String> = record.iter().map(|c| c.to_string()).collect();
        match headers.as_ref() {
            None => {
                if is_blank_row(&cells) {
                    return Err(DecodeError::Malformed("missing header row".to_string()));
                }
                headers = Some(cells.iter().map(|c| c.trim().to_string()).collect());
            }
            Some(hdrs) => {
                if is_blank_row(&cells) {
                    break;
                }
                if rows.len() >= limits.max_rows {
                    return Err(DecodeError::FileTooLarge(format!(
                        "file has more than {} data rows",
                        limits.max_rows
                    )));
                }
                rows.push(RawRow {
                    source_row: rows.len(),
                    cells: align_to(hdrs.len(), cells),
                });
            }
        }
    }

    let headers = headers.ok_or_else(|| DecodeError::Malformed("missing header row".to_string()))?;
    Ok(DecodedFile { headers, rows })
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        // f64::to_string renders integral floats without a trailing ".0",
        // so a cell holding 85 decodes as "85".
        Data::Float(v) => v.to_string(),
        Data::Int(v) => v.to_string(),
        Data::Bool(v) => v.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{e:?}"),
    }
}

fn decode_range(range: calamine::Range<Data>, limits: &DecodeLimits) -> Result<DecodedFile, DecodeError> {
    let mut sheet_rows = range.rows();
    let headers: Vec<String> = sheet_rows
        .next()
        .map(|row| row.iter().map(|c| cell_text(c).trim().to_string()).collect())
        .ok_or_else(|| DecodeError::Malformed("missing header row".to_string()))?;
    if is_blank_row(&headers) {
        return Err(DecodeError::Malformed("missing header row".to_string()));
    }

    let mut rows = Vec::new();
    for row in sheet_rows {
        let cells: Vec<String> = row.iter().map(cell_text).collect();
        if is_blank_row(&cells) {
            break;
        }
        if rows.len() >= limits.max_rows {
            return Err(DecodeError::FileTooLarge(format!(
                "file has more than {} data rows",
                limits.max_rows
            )));
        }
        rows.push(RawRow {
            source_row: rows.len(),
            cells: align_to(headers.len(), cells),
        });
    }
    Ok(DecodedFile { headers, rows })
}
