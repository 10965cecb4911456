use std::io;

/// A bounded set of rows fetched or processed together.
///
/// The source endpoint decides which columns a payload carries, so a batch is
/// a mapping from column name to cell values rather than a fixed record.
/// An empty CSV field is a missing value, not an empty string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl RowBatch {
    pub fn new(columns: Vec<String>) -> RowBatch {
        RowBatch {
            columns,
            rows: Vec::new(),
        }
    }

    /// Read a CSV payload with a header line into a batch.
    pub fn from_csv_reader<R: io::Read>(rdr: R) -> Result<RowBatch, csv::Error> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(rdr);
        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut batch = RowBatch::new(columns);
        for record in reader.records() {
            let record = record?;
            // rows shorter than the header are padded with missing values
            let row = (0..batch.columns.len())
                .map(|i| match record.get(i) {
                    None | Some("") => None,
                    Some(value) => Some(value.to_string()),
                })
                .collect();
            batch.rows.push(row);
        }
        Ok(batch)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell value by column name.  `None` when the column is absent from the
    /// batch or the cell is missing.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.column_index(column)?;
        self.value(row, col)
    }

    /// Cell value by column index.
    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows[row][col].as_deref()
    }

    pub fn set(&mut self, row: usize, col: usize, value: Option<String>) {
        self.rows[row][col] = value;
    }

    pub fn push_row(&mut self, row: Vec<Option<String>>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Append a column, filling every existing row with `value`.
    pub fn add_column(&mut self, name: &str, value: Option<String>) {
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(value.clone());
        }
    }

    /// Keep only the rows for which the predicate returns true.
    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[Option<String>]) -> bool,
    {
        self.rows.retain(|row| keep(row));
    }
}
