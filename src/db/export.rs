use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use rust_xlsxwriter::{ExcelDateTime, Format, Workbook, Worksheet, XlsxError};

use super::normalizer::clean_for_export;
use super::value::{CellValue, RawResultSet};
use crate::error::EngineError;

/// Data rows a single worksheet can hold below the header row.
pub const MAX_DATA_ROWS: usize = 1_048_575;

const DATE_FORMAT: &str = "yyyy-mm-dd";
const DATETIME_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";

/// Spreadsheet layout options.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub sheet_name: String,
    pub max_column_width: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            sheet_name: "Data".to_string(),
            max_column_width: 50,
        }
    }
}

/// Write the full result set into a single-sheet `.xlsx` workbook.
pub fn write_xlsx(raw: RawResultSet, options: &ExportOptions) -> Result<Vec<u8>, EngineError> {
    if raw.rows.len() > MAX_DATA_ROWS {
        return Err(EngineError::Export(format!(
            "Result has {} rows; a worksheet holds at most {}",
            raw.rows.len(),
            MAX_DATA_ROWS
        )));
    }
    if raw.columns.len() > u16::MAX as usize {
        return Err(EngineError::Export(format!(
            "Result has too many columns ({})",
            raw.columns.len()
        )));
    }

    build_workbook(raw, options).map_err(|e| EngineError::Export(e.to_string()))
}

fn build_workbook(raw: RawResultSet, options: &ExportOptions) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let date_format = Format::new().set_num_format(DATE_FORMAT);
    let datetime_format = Format::new().set_num_format(DATETIME_FORMAT);

    let sheet = workbook.add_worksheet();
    sheet.set_name(&options.sheet_name)?;

    let mut widths: Vec<usize> = raw.columns.iter().map(|c| c.chars().count()).collect();

    for (col, name) in raw.columns.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, name, &header_format)?;
    }

    for (index, row) in raw.rows.into_iter().enumerate() {
        let row_num = (index + 1) as u32;
        for (col, cell) in row.into_iter().enumerate() {
            let cell = clean_for_export(cell);
            let len = display_len(&cell);
            if let Some(width) = widths.get_mut(col) {
                *width = (*width).max(len);
            }
            write_cell(sheet, row_num, col as u16, cell, &date_format, &datetime_format)?;
        }
    }

    for (col, width) in widths.iter().enumerate() {
        let width = (width + 2).min(options.max_column_width);
        sheet.set_column_width(col as u16, width as f64)?;
    }

    workbook.save_to_buffer()
}

fn write_cell(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    cell: CellValue,
    date_format: &Format,
    datetime_format: &Format,
) -> Result<(), XlsxError> {
    match cell {
        CellValue::Null => {}
        CellValue::Bool(b) => {
            sheet.write_boolean(row, col, b)?;
        }
        CellValue::Int(i) => {
            sheet.write_number(row, col, i as f64)?;
        }
        CellValue::Float(f) => {
            sheet.write_number(row, col, f)?;
        }
        CellValue::Text(s) => {
            sheet.write_string(row, col, &s)?;
        }
        CellValue::Date(d) => match excel_date(d) {
            Some(date) => {
                sheet.write_datetime_with_format(row, col, &date, date_format)?;
            }
            None => {
                sheet.write_string(row, col, d.format("%Y-%m-%d").to_string())?;
            }
        },
        CellValue::DateTime(dt) => write_datetime_cell(sheet, row, col, dt, datetime_format)?,
        CellValue::DateTimeTz(dt) => {
            write_datetime_cell(sheet, row, col, dt.naive_local(), datetime_format)?
        }
    }
    Ok(())
}

fn write_datetime_cell(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    dt: NaiveDateTime,
    format: &Format,
) -> Result<(), XlsxError> {
    match excel_datetime(dt) {
        Some(value) => sheet.write_datetime_with_format(row, col, &value, format)?,
        None => sheet.write_string(row, col, dt.format("%Y-%m-%d %H:%M:%S").to_string())?,
    };
    Ok(())
}

/// Dates outside Excel's 1900-9999 range have no serial and are written as text.
fn excel_date(date: NaiveDate) -> Option<ExcelDateTime> {
    let year = u16::try_from(date.year()).ok()?;
    ExcelDateTime::from_ymd(year, date.month() as u8, date.day() as u8).ok()
}

fn excel_datetime(dt: NaiveDateTime) -> Option<ExcelDateTime> {
    let time = dt.time();
    let seconds = time.second() as f64 + time.nanosecond() as f64 / 1_000_000_000.0;
    excel_date(dt.date())?
        .and_hms(time.hour() as u16, time.minute() as u8, seconds)
        .ok()
}

fn display_len(cell: &CellValue) -> usize {
    match cell {
        CellValue::Null => 0,
        CellValue::Bool(b) => b.to_string().len(),
        CellValue::Int(i) => i.to_string().len(),
        CellValue::Float(f) => f.to_string().len(),
        CellValue::Text(s) => s.chars().count(),
        CellValue::Date(_) => DATE_FORMAT.len(),
        CellValue::DateTime(_) | CellValue::DateTimeTz(_) => DATETIME_FORMAT.len(),
    }
}

/// `<name>_<YYYYMMDD_HHMMSS>.xlsx`, with filesystem-hostile characters replaced.
pub fn export_file_name(report_name: &str, at: NaiveDateTime) -> String {
    let safe: String = report_name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let safe = if safe.is_empty() { "report".to_string() } else { safe };
    format!("{}_{}.xlsx", safe, at.format("%Y%m%d_%H%M%S"))
}
