//! In-memory string tables.
//!
//! Extracted and cleaned tables are small (tens of rows), so a [`Table`] is
//! just a header and rows of owned strings. The empty string stands for a
//! missing value. Cleaners coerce to numbers only at the point they need
//! arithmetic, through [`parse_number`].

use crate::error::PipelineError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::Path;

/// A header plus rows of string cells, every row as wide as the header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    name: String,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// An empty table with the given header.
    pub fn new(name: impl Into<String>, header: Vec<String>) -> Self {
        Self {
            name: name.into(),
            header,
            rows: Vec::new(),
        }
    }

    /// Build a table whose first record is the header. Short rows are
    /// padded and long rows widen the header with `Unnamed: {i}` columns.
    /// Repeated names get a `.1`, `.2`, ... suffix so every column can be
    /// found by name.
    pub fn from_records(name: impl Into<String>, mut records: Vec<Vec<String>>) -> Self {
        let mut table = Self::new(name, Vec::new());
        if records.is_empty() {
            return table;
        }
        let header = records.remove(0);
        let width = records
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(header.len()))
            .max()
            .unwrap_or(0);
        let names: Vec<String> = (0..width)
            .map(|i| match header.get(i).map(|h| h.trim()) {
                Some(h) if !h.is_empty() => h.to_string(),
                _ => format!("Unnamed: {i}"),
            })
            .collect();
        table.header = dedupe_names(names);
        for row in records {
            table.push_row(row);
        }
        table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.header.len()
    }

    /// Append a row, padding or truncating it to the header width.
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.header.len(), String::new());
        self.rows.push(row);
    }

    // ── CSV I/O ──────────────────────────────────────────────────────────

    /// Read a CSV file whose first record is the header.
    pub fn read_csv(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let csv_err = |source| PipelineError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(csv_err)?;

        let mut records = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            records.push(record.iter().map(str::to_string).collect());
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::from_records(name, records))
    }

    /// Write the table as CSV through a temporary file in the target
    /// directory, renamed into place once complete.
    pub fn write_csv(&self, path: &Path) -> Result<(), PipelineError> {
        let write_err = |source| PipelineError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        };
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let dir = dir.unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            let csv_err = |source| PipelineError::Csv {
                path: path.to_path_buf(),
                source,
            };
            writer.write_record(&self.header).map_err(csv_err)?;
            for row in &self.rows {
                writer.write_record(row).map_err(csv_err)?;
            }
            writer.flush().map_err(write_err)?;
        }
        tmp.as_file_mut().flush().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    // ── Lookup ───────────────────────────────────────────────────────────

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    /// Like [`Table::column_index`], but a missing column is an error.
    pub fn require_column(&self, name: &str) -> Result<usize, PipelineError> {
        self.column_index(name)
            .ok_or_else(|| PipelineError::MissingColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row).and_then(|r| r.get(col)).map(String::as_str)
    }

    /// Values of a named column, top to bottom.
    pub fn column(&self, name: &str) -> Result<Vec<&str>, PipelineError> {
        let idx = self.require_column(name)?;
        Ok(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    // ── Row and cell edits ───────────────────────────────────────────────

    /// Remove rows by position (positions refer to the table before removal).
    pub fn drop_rows(&mut self, positions: &[usize]) -> Result<(), PipelineError> {
        if let Some(&bad) = positions.iter().find(|&&p| p >= self.rows.len()) {
            return Err(self.out_of_range(bad, 0));
        }
        let mut position = 0;
        self.rows.retain(|_| {
            let keep = !positions.contains(&position);
            position += 1;
            keep
        });
        Ok(())
    }

    /// Keep only rows matching `pred`.
    pub fn retain_rows(&mut self, mut pred: impl FnMut(&[String]) -> bool) {
        self.rows.retain(|r| pred(r));
    }

    pub fn set_cell(
        &mut self,
        row: usize,
        col: usize,
        value: impl Into<String>,
    ) -> Result<(), PipelineError> {
        if col >= self.header.len() {
            return Err(self.out_of_range(row, col));
        }
        match self.rows.get_mut(row) {
            Some(r) => {
                r[col] = value.into();
                Ok(())
            }
            None => Err(self.out_of_range(row, col)),
        }
    }

    fn out_of_range(&self, row: usize, col: usize) -> PipelineError {
        PipelineError::CellOutOfRange {
            table: self.name.clone(),
            row,
            col,
        }
    }

    // ── Column edits ─────────────────────────────────────────────────────

    /// Rename columns by name. Names absent from the table are ignored.
    pub fn rename_columns(&mut self, map: &BTreeMap<String, String>) {
        for h in &mut self.header {
            if let Some(new) = map.get(h.as_str()) {
                *h = new.clone();
            }
        }
    }

    /// Rename the column at `position`, if it exists.
    pub fn rename_at(&mut self, position: usize, name: impl Into<String>) {
        if let Some(h) = self.header.get_mut(position) {
            *h = name.into();
        }
    }

    /// Replace every value of a column with `f(row_position, value)`.
    pub fn map_column(
        &mut self,
        name: &str,
        mut f: impl FnMut(usize, &str) -> String,
    ) -> Result<(), PipelineError> {
        let idx = self.require_column(name)?;
        for (i, row) in self.rows.iter_mut().enumerate() {
            row[idx] = f(i, &row[idx]);
        }
        Ok(())
    }

    /// Apply `f` to every cell of the table.
    pub fn map_cells(&mut self, mut f: impl FnMut(&str) -> String) {
        for row in &mut self.rows {
            for cell in row.iter_mut() {
                *cell = f(cell);
            }
        }
    }

    /// Split a column into `new_names.len()` columns.
    ///
    /// The separator is `-` when the first value contains one, whitespace
    /// otherwise. Missing parts are left empty and surplus parts stay joined
    /// in the last column. Target columns are overwritten if they exist.
    pub fn split_column(&mut self, name: &str, new_names: &[&str]) -> Result<(), PipelineError> {
        let idx = self.require_column(name)?;
        let on_dash = self
            .rows
            .first()
            .map(|r| r[idx].contains('-'))
            .unwrap_or(false);
        self.split_at(idx, on_dash, new_names);
        Ok(())
    }

    /// Split a column on whitespace only. See [`Table::split_column`].
    pub fn split_column_whitespace(
        &mut self,
        name: &str,
        new_names: &[&str],
    ) -> Result<(), PipelineError> {
        let idx = self.require_column(name)?;
        self.split_at(idx, false, new_names);
        Ok(())
    }

    fn split_at(&mut self, idx: usize, on_dash: bool, new_names: &[&str]) {
        let n = new_names.len();
        let parts: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| {
                let value = r[idx].trim();
                let mut pieces: Vec<String> = if on_dash {
                    value.splitn(n, '-').map(|p| p.trim().to_string()).collect()
                } else {
                    let words: Vec<&str> = value.split_whitespace().collect();
                    if words.len() > n && n > 0 {
                        let mut head: Vec<String> =
                            words[..n - 1].iter().map(|w| w.to_string()).collect();
                        head.push(words[n - 1..].join(" "));
                        head
                    } else {
                        words.iter().map(|w| w.to_string()).collect()
                    }
                };
                pieces.resize(n, String::new());
                pieces
            })
            .collect();

        for (k, new_name) in new_names.iter().enumerate() {
            let values = parts.iter().map(|p| p[k].clone()).collect();
            self.set_column(new_name, values);
        }
    }

    /// Remove columns by name. Names absent from the table are ignored.
    pub fn remove_columns(&mut self, names: &[&str]) {
        let keep: Vec<bool> = self
            .header
            .iter()
            .map(|h| !names.contains(&h.as_str()))
            .collect();
        self.retain_columns(&keep);
    }

    /// Remove the column at `position`, if it exists.
    pub fn remove_at(&mut self, position: usize) {
        if position < self.header.len() {
            let keep: Vec<bool> = (0..self.header.len()).map(|i| i != position).collect();
            self.retain_columns(&keep);
        }
    }

    /// Drop columns whose every value is empty.
    pub fn drop_empty_columns(&mut self) {
        let keep: Vec<bool> = (0..self.header.len())
            .map(|c| self.rows.iter().any(|r| !r[c].trim().is_empty()))
            .collect();
        self.retain_columns(&keep);
    }

    fn retain_columns(&mut self, keep: &[bool]) {
        let filter = |cells: &mut Vec<String>| {
            let mut i = 0;
            cells.retain(|_| {
                let k = keep[i];
                i += 1;
                k
            });
        };
        filter(&mut self.header);
        for row in &mut self.rows {
            filter(row);
        }
    }

    /// Append a column, padding or truncating `values` to the row count.
    pub fn push_column(&mut self, name: impl Into<String>, mut values: Vec<String>) {
        values.resize(self.rows.len(), String::new());
        self.header.push(name.into());
        for (row, v) in self.rows.iter_mut().zip(values) {
            row.push(v);
        }
    }

    /// Overwrite a column if it exists, otherwise append it.
    pub fn set_column(&mut self, name: &str, mut values: Vec<String>) {
        match self.column_index(name) {
            Some(idx) => {
                values.resize(self.rows.len(), String::new());
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => self.push_column(name, values),
        }
    }

    /// Move a column to the last position.
    pub fn move_to_end(&mut self, name: &str) -> Result<(), PipelineError> {
        let idx = self.require_column(name)?;
        let h = self.header.remove(idx);
        self.header.push(h);
        for row in &mut self.rows {
            let v = row.remove(idx);
            row.push(v);
        }
        Ok(())
    }

    // ── Reshaping ────────────────────────────────────────────────────────

    /// Swap rows and columns.
    ///
    /// The first column's values become the new header and the remaining
    /// original header names become the row labels, returned alongside the
    /// table.
    pub fn transpose(&self) -> (Table, Vec<String>) {
        let header: Vec<String> = self
            .rows
            .iter()
            .map(|r| r.first().cloned().unwrap_or_default())
            .collect();
        let mut out = Table::new(self.name.clone(), header);
        let mut index = Vec::with_capacity(self.header.len().saturating_sub(1));
        for c in 1..self.header.len() {
            index.push(self.header[c].clone());
            out.push_row(self.rows.iter().map(|r| r[c].clone()).collect());
        }
        (out, index)
    }

    /// Stack tables vertically over the union of their columns, in
    /// first-seen order. Cells of columns a table lacks are left empty.
    pub fn concat(name: impl Into<String>, tables: &[Table]) -> Table {
        let mut header: Vec<String> = Vec::new();
        for t in tables {
            for h in &t.header {
                if !header.contains(h) {
                    header.push(h.clone());
                }
            }
        }
        let mut out = Table::new(name, header);
        for t in tables {
            let positions: Vec<Option<usize>> =
                out.header.iter().map(|h| t.column_index(h)).collect();
            for row in &t.rows {
                let cells = positions
                    .iter()
                    .map(|p| p.map(|i| row[i].clone()).unwrap_or_default())
                    .collect();
                out.rows.push(cells);
            }
        }
        out
    }
}

/// Suffix repeated names with `.{n}`, skipping suffixes already in use.
fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(names.len());
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let mut unique = name.clone();
        while seen.contains(&unique) {
            let n = counts.entry(name.clone()).or_insert(0);
            *n += 1;
            unique = format!("{name}.{n}");
        }
        seen.insert(unique.clone());
        out.push(unique);
    }
    out
}

// ── Numeric helpers ──────────────────────────────────────────────────────

/// Parse a cell as a float. Empty and unparsable cells are missing.
pub fn parse_number(cell: &str) -> Option<f64> {
    let t = cell.trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Format a float the way cleaned tables store it: integers without a
/// fractional part, missing as the empty string.
pub fn format_number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", v as i64),
        Some(v) => format!("{v}"),
        None => String::new(),
    }
}

/// Coerce a cell to an integer, truncating fractions; missing becomes 0.
pub fn to_int_or_zero(cell: &str) -> i64 {
    parse_number(cell).map(|v| v.trunc() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    fn sample() -> Table {
        Table::from_records(
            "t.csv",
            vec![
                s(&["", "mdma", ""]),
                s(&["2019", "1.2", "a"]),
                s(&["2020", "900", ""]),
                s(&["2021", "", "c"]),
            ],
        )
    }


    #[test]
    fn repeated_header_names_get_suffixes() {
        let t = Table::from_records(
            "227_0.csv",
            vec![
                s(&["n", "%", "n", "%", "n", "n.1"]),
                s(&["700", "90", "50", "6", "5", "1"]),
            ],
        );
        assert_eq!(t.header(), &s(&["n", "%", "n.1", "%.1", "n.2", "n.1.1"])[..]);
        assert_eq!(t.column("n.1").unwrap(), vec!["50"]);
        assert_eq!(t.column("%.1").unwrap(), vec!["6"]);
        assert_eq!(t.column("n.1.1").unwrap(), vec!["1"]);
    }
    #[test]
    fn from_records_names_empty_headers() {
        let t = sample();
        assert_eq!(t.header(), &s(&["Unnamed: 0", "mdma", "Unnamed: 2"]));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn from_records_widens_for_long_rows() {
        let t = Table::from_records("x", vec![s(&["a"]), s(&["1", "2"])]);
        assert_eq!(t.header(), &s(&["a", "Unnamed: 1"]));
        assert_eq!(t.cell(0, 1), Some("2"));
    }

    #[test]
    fn drop_rows_uses_original_positions() {
        let mut t = sample();
        t.drop_rows(&[0, 2]).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.cell(0, 0), Some("2020"));
        assert!(t.drop_rows(&[5]).is_err());
    }

    #[test]
    fn set_cell_bounds() {
        let mut t = sample();
        t.set_cell(1, 1, "35").unwrap();
        assert_eq!(t.cell(1, 1), Some("35"));
        assert!(matches!(
            t.set_cell(9, 0, "x"),
            Err(PipelineError::CellOutOfRange { row: 9, .. })
        ));
    }

    #[test]
    fn split_column_on_dash_or_space() {
        let mut t = Table::from_records(
            "d",
            vec![s(&["range", "dose"]), s(&["10-20", "120 (35)"]), s(&["5 - 7", "90"])],
        );
        t.split_column("range", &["min", "max"]).unwrap();
        t.split_column("dose", &["mean", "sd"]).unwrap();
        assert_eq!(t.column("min").unwrap(), vec!["10", "5"]);
        assert_eq!(t.column("max").unwrap(), vec!["20", "7"]);
        assert_eq!(t.column("mean").unwrap(), vec!["120", "90"]);
        assert_eq!(t.column("sd").unwrap(), vec!["(35)", ""]);
    }

    #[test]
    fn remove_and_drop_empty_columns() {
        let mut t = Table::from_records("e", vec![s(&["a", "b", "c"]), s(&["1", "", "3"])]);
        t.drop_empty_columns();
        assert_eq!(t.header(), &s(&["a", "c"]));
        t.remove_columns(&["a", "zzz"]);
        assert_eq!(t.header(), &s(&["c"]));
    }

    #[test]
    fn transpose_returns_index() {
        let t = Table::from_records(
            "n",
            vec![
                s(&["", "Ambulances", "EHBO"]),
                s(&["incidents", "10", "20"]),
                s(&["median_age", "22", "23"]),
            ],
        );
        let (tt, index) = t.transpose();
        assert_eq!(tt.header(), &s(&["incidents", "median_age"]));
        assert_eq!(index, s(&["Ambulances", "EHBO"]));
        assert_eq!(tt.rows()[1], s(&["20", "23"]));
    }

    #[test]
    fn concat_unions_columns() {
        let a = Table::from_records("a", vec![s(&["x", "y"]), s(&["1", "2"])]);
        let b = Table::from_records("b", vec![s(&["y", "z"]), s(&["3", "4"])]);
        let c = Table::concat("c", &[a, b]);
        assert_eq!(c.header(), &s(&["x", "y", "z"]));
        assert_eq!(c.rows()[1], s(&["", "3", "4"]));
    }

    #[test]
    fn csv_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/out.csv");
        let t = sample();
        t.write_csv(&path).unwrap();
        let back = Table::read_csv(&path).unwrap();
        assert_eq!(back.header(), t.header());
        assert_eq!(back.rows(), t.rows());
        assert_eq!(back.name(), "out.csv");
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number(" 3.5 "), Some(3.5));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(format_number(Some(2000.0)), "2000");
        assert_eq!(format_number(Some(0.25)), "0.25");
        assert_eq!(format_number(None), "");
        assert_eq!(to_int_or_zero("12.9"), 12);
        assert_eq!(to_int_or_zero("-"), 0);
    }
}
