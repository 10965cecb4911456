use std::thread;
use std::time::Duration;

use jiff::civil::Date;
use log::{error, info, warn};
use reqwest::StatusCode;
use thiserror::Error;

use crate::batch::RowBatch;
use crate::transform::parse_case_month;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("api request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api request returned status {0}")]
    Status(StatusCode),
    #[error("failed to parse csv payload: {0}")]
    Csv(#[from] csv::Error),
}

/// Result of one page fetch.  An exhausted retry budget is reported as
/// `Failed`, distinct from a page that legitimately has no rows left.
#[derive(Debug)]
pub enum FetchOutcome {
    Data(RowBatch),
    Empty,
    Failed(FetchError),
}

/// One bounded request for `limit` rows starting at `offset`.
pub trait PageSource {
    fn fetch_page(&self, limit: usize, offset: usize) -> FetchOutcome;
}

/// Client for the CDC case surveillance endpoint.  `base_url` is a template
/// with `{limit}` and `{offset}` placeholders, e.g.
/// `https://data.cdc.gov/resource/n8mc-b4w4.csv?$limit={limit}&$offset={offset}`.
pub struct CdcCaseClient {
    pub base_url: String,
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl CdcCaseClient {
    pub fn new(base_url: String) -> CdcCaseClient {
        CdcCaseClient {
            base_url,
            retries: 3,
            retry_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn page_url(&self, limit: usize, offset: usize) -> String {
        self.base_url
            .replace("{limit}", &limit.to_string())
            .replace("{offset}", &offset.to_string())
    }

    fn request_page(&self, limit: usize, offset: usize) -> Result<RowBatch, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let response = client.get(self.page_url(limit, offset)).send()?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::Status(response.status()));
        }
        let body = response.text()?;
        Ok(RowBatch::from_csv_reader(body.as_bytes())?)
    }

    /// Fetch the data in chunks, lazily.  `chunk_size` rows are requested per
    /// call, `max_rows` caps the total, and the optional date range filters
    /// on `case_month` when that column is present.
    pub fn fetch_chunks(
        &self,
        chunk_size: usize,
        max_rows: Option<usize>,
        start_date: Option<Date>,
        end_date: Option<Date>,
    ) -> ChunkIter<'_, CdcCaseClient> {
        ChunkIter::new(self, chunk_size, max_rows, start_date, end_date)
    }
}

impl PageSource for CdcCaseClient {
    fn fetch_page(&self, limit: usize, offset: usize) -> FetchOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request_page(limit, offset) {
                Ok(batch) => {
                    info!("fetched {} rows from offset {}", batch.len(), offset);
                    return if batch.is_empty() {
                        FetchOutcome::Empty
                    } else {
                        FetchOutcome::Data(batch)
                    };
                }
                Err(e) => {
                    error!("{}", e);
                    if attempt >= self.retries.max(1) {
                        error!("failed to fetch data after {} attempts", attempt);
                        return FetchOutcome::Failed(e);
                    }
                    warn!(
                        "attempt {} failed, retrying in {}s",
                        attempt,
                        self.retry_delay.as_secs_f64()
                    );
                    thread::sleep(self.retry_delay);
                }
            }
        }
    }
}

/// Forward-only, finite iterator over row batches.
pub struct ChunkIter<'a, S: PageSource + ?Sized> {
    source: &'a S,
    chunk_size: usize,
    max_rows: Option<usize>,
    start_date: Option<Date>,
    end_date: Option<Date>,
    offset: usize,
    total_rows: usize,
    done: bool,
}

impl<'a, S: PageSource + ?Sized> ChunkIter<'a, S> {
    pub fn new(
        source: &'a S,
        chunk_size: usize,
        max_rows: Option<usize>,
        start_date: Option<Date>,
        end_date: Option<Date>,
    ) -> ChunkIter<'a, S> {
        ChunkIter {
            source,
            chunk_size,
            max_rows,
            start_date,
            end_date,
            offset: 0,
            total_rows: 0,
            done: false,
        }
    }

    fn date_filter_active(&self) -> bool {
        self.start_date.is_some() || self.end_date.is_some()
    }
}

impl<S: PageSource + ?Sized> Iterator for ChunkIter<'_, S> {
    type Item = RowBatch;

    fn next(&mut self) -> Option<RowBatch> {
        if self.done {
            return None;
        }
        if let Some(max) = self.max_rows {
            if self.total_rows >= max {
                self.done = true;
                return None;
            }
        }
        let limit = match self.max_rows {
            Some(max) => self.chunk_size.min(max - self.total_rows),
            None => self.chunk_size,
        };

        let raw = match self.source.fetch_page(limit, self.offset) {
            FetchOutcome::Data(batch) => batch,
            FetchOutcome::Empty => {
                info!("no more data to fetch, {} rows fetched in total", self.total_rows);
                self.done = true;
                return None;
            }
            FetchOutcome::Failed(e) => {
                error!("stopping fetch at offset {}: {}", self.offset, e);
                self.done = true;
                return None;
            }
        };
        let raw_len = raw.len();

        let batch = if self.date_filter_active() {
            if raw.has_column("case_month") {
                filter_by_case_month(raw, self.start_date, self.end_date)
            } else {
                warn!("date filtering requested but 'case_month' column not found");
                raw
            }
        } else {
            raw
        };

        if self.date_filter_active() && batch.is_empty() {
            info!("chunk became empty after date filtering, stopping fetch");
            self.done = true;
            return None;
        }

        self.total_rows += batch.len();
        // advance by chunk_size, not by the rows kept, so a batch shrunk by
        // the date filter does not cause rows to be fetched twice
        self.offset += self.chunk_size;

        if raw_len < limit {
            info!("no more data to fetch, {} rows fetched in total", self.total_rows);
            self.done = true;
        }
        Some(batch)
    }
}

/// Keep only the rows whose `case_month` falls inside the range.  Rows whose
/// date does not parse are dropped when a filter is active.
fn filter_by_case_month(
    mut batch: RowBatch,
    start_date: Option<Date>,
    end_date: Option<Date>,
) -> RowBatch {
    let Some(col) = batch.column_index("case_month") else {
        return batch;
    };
    batch.retain_rows(|row| match row[col].as_deref().and_then(parse_case_month) {
        Some(date) => {
            start_date.is_none_or(|start| date >= start) && end_date.is_none_or(|end| date <= end)
        }
        None => false,
    });
    batch
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use jiff::civil::date;

    use super::*;

    /// Replays a canned sequence of outcomes and records the (limit, offset)
    /// of every call.  Once the script runs out it reports `Empty`.
    struct ScriptedSource {
        pages: RefCell<VecDeque<FetchOutcome>>,
        calls: RefCell<Vec<(usize, usize)>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<FetchOutcome>) -> ScriptedSource {
            ScriptedSource {
                pages: RefCell::new(pages.into()),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(usize, usize)> {
            self.calls.borrow().clone()
        }
    }

    impl PageSource for ScriptedSource {
        fn fetch_page(&self, limit: usize, offset: usize) -> FetchOutcome {
            self.calls.borrow_mut().push((limit, offset));
            self.pages
                .borrow_mut()
                .pop_front()
                .unwrap_or(FetchOutcome::Empty)
        }
    }

    fn month_batch(months: &[&str]) -> RowBatch {
        let mut payload = String::from("case_month,res_state\n");
        for m in months {
            payload.push_str(m);
            payload.push_str(",NY\n");
        }
        RowBatch::from_csv_reader(payload.as_bytes()).unwrap()
    }

    fn state_batch(n: usize) -> RowBatch {
        let mut payload = String::from("res_state\n");
        for _ in 0..n {
            payload.push_str("NY\n");
        }
        RowBatch::from_csv_reader(payload.as_bytes()).unwrap()
    }

    #[test]
    fn stops_after_a_short_page() {
        let source = ScriptedSource::new(vec![
            FetchOutcome::Data(state_batch(2)),
            FetchOutcome::Data(state_batch(1)),
        ]);
        let chunks: Vec<RowBatch> = ChunkIter::new(&source, 2, None, None, None).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].len(), 1);
        // the short second page ends the sequence, no third request is made
        assert_eq!(source.calls(), vec![(2, 0), (2, 2)]);
    }

    #[test]
    fn stops_on_an_empty_page() {
        let source = ScriptedSource::new(vec![
            FetchOutcome::Data(state_batch(2)),
            FetchOutcome::Empty,
        ]);
        let chunks: Vec<RowBatch> = ChunkIter::new(&source, 2, None, None, None).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(source.calls().len(), 2);
    }

    #[test]
    fn stops_on_a_failed_page() {
        let source = ScriptedSource::new(vec![FetchOutcome::Failed(FetchError::Status(
            StatusCode::INTERNAL_SERVER_ERROR,
        ))]);
        let chunks: Vec<RowBatch> = ChunkIter::new(&source, 2, None, None, None).collect();
        assert!(chunks.is_empty());
        assert_eq!(source.calls().len(), 1);
    }

    #[test]
    fn splits_the_last_request_to_fit_the_budget() {
        let source = ScriptedSource::new(vec![
            FetchOutcome::Data(state_batch(100)),
            FetchOutcome::Data(state_batch(50)),
        ]);
        let chunks: Vec<RowBatch> =
            ChunkIter::new(&source, 100, Some(150), None, None).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(source.calls(), vec![(100, 0), (50, 100)]);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 150);
    }

    #[test]
    fn never_yields_more_than_max_rows() {
        let source = ScriptedSource::new(vec![
            FetchOutcome::Data(state_batch(3)),
            FetchOutcome::Data(state_batch(2)),
            FetchOutcome::Data(state_batch(3)),
        ]);
        let chunks: Vec<RowBatch> = ChunkIter::new(&source, 3, Some(5), None, None).collect();
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 5);
        // the second request only asks for the 2 remaining rows, and the
        // exhausted budget ends the sequence without a third request
        assert_eq!(source.calls(), vec![(3, 0), (2, 3)]);
    }

    #[test]
    fn offset_advances_by_chunk_size_after_filtering() {
        let source = ScriptedSource::new(vec![
            FetchOutcome::Data(month_batch(&["2021-01", "2021-02", "2021-03"])),
            FetchOutcome::Data(month_batch(&["2021-02", "2021-02", "2021-03"])),
            FetchOutcome::Empty,
        ]);
        let start = Some(date(2021, 2, 1));
        let chunks: Vec<RowBatch> = ChunkIter::new(&source, 3, None, start, None).collect();
        assert_eq!(chunks.len(), 2);
        // the first batch shrank to 2 rows but the offsets still step by 3
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].len(), 3);
        let offsets: Vec<usize> = source.calls().iter().map(|c| c.1).collect();
        assert_eq!(offsets, vec![0, 3, 6]);
    }

    #[test]
    fn end_date_is_inclusive() {
        let source = ScriptedSource::new(vec![FetchOutcome::Data(month_batch(&[
            "2021-01", "2021-02", "2021-03",
        ]))]);
        let chunks: Vec<RowBatch> = ChunkIter::new(
            &source,
            5,
            None,
            Some(date(2021, 1, 1)),
            Some(date(2021, 2, 1)),
        )
        .collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 2);
    }

    #[test]
    fn stops_when_the_filter_empties_a_chunk() {
        let source = ScriptedSource::new(vec![
            FetchOutcome::Data(month_batch(&["2021-01", "2021-02"])),
            FetchOutcome::Data(month_batch(&["2022-05", "2022-06"])),
        ]);
        let start = Some(date(2022, 1, 1));
        let chunks: Vec<RowBatch> = ChunkIter::new(&source, 2, None, start, None).collect();
        // the first chunk filters to nothing, so the fetch stops right there
        assert!(chunks.is_empty());
        assert_eq!(source.calls().len(), 1);
    }

    #[test]
    fn missing_date_column_skips_filtering() {
        let source = ScriptedSource::new(vec![FetchOutcome::Data(state_batch(3))]);
        let start = Some(date(2022, 1, 1));
        let chunks: Vec<RowBatch> = ChunkIter::new(&source, 5, None, start, None).collect();
        // rows pass through unfiltered when there is no case_month column
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3);
    }

    #[test]
    fn unparsable_dates_are_dropped_by_an_active_filter() {
        let source = ScriptedSource::new(vec![FetchOutcome::Data(month_batch(&[
            "2021-02", "garbage",
        ]))]);
        let chunks: Vec<RowBatch> =
            ChunkIter::new(&source, 5, None, Some(date(2021, 1, 1)), None).collect();
        assert_eq!(chunks[0].len(), 1);
    }

    #[test]
    fn page_url_substitutes_placeholders() {
        let client = CdcCaseClient::new(
            "https://example.com/data.csv?$limit={limit}&$offset={offset}".to_string(),
        );
        assert_eq!(
            client.page_url(100, 300),
            "https://example.com/data.csv?$limit=100&$offset=300"
        );
    }

    #[test]
    fn exhausted_retries_report_a_failure() {
        // nothing listens on the discard port, every attempt is refused
        let mut client = CdcCaseClient::new("http://127.0.0.1:9/data.csv".to_string());
        client.retries = 2;
        client.retry_delay = Duration::ZERO;
        client.timeout = Duration::from_secs(1);
        let outcome = client.fetch_page(10, 0);
        assert!(matches!(
            outcome,
            FetchOutcome::Failed(FetchError::Transport(_))
        ));
    }
}
