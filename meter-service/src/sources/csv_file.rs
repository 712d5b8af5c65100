use std::{fs::File, path::PathBuf, time::SystemTime};

use csv::StringRecord;
use meter_client::domain::Sample;

use super::unix_seconds;
use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// CSV backfill source.
///
/// Expected header columns (by name):
/// - timestamp (unix seconds, optional; blank means "now")
/// - count
pub struct SampleCsvFileSource {
    path: PathBuf,
}

impl SampleCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn record_to_sample(
    record: &StringRecord,
    headers: &StringRecord,
    received_at: SystemTime,
) -> Result<Sample, String> {
    let get = |name: &str| -> Option<&str> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
            .map(str::trim)
    };

    let count_str = get("count")
        .ok_or_else(|| "missing column 'count' in CSV record".to_string())?;
    let count: i64 = count_str
        .parse()
        .map_err(|e| format!("invalid count '{count_str}': {e}"))?;

    let timestamp = match get("timestamp") {
        Some(s) if !s.is_empty() => s
            .parse()
            .map_err(|e| format!("invalid timestamp '{s}': {e}"))?,
        _ => unix_seconds(received_at),
    };

    Ok(Sample::new(timestamp, count))
}

#[async_trait::async_trait]
impl Source<Sample> for SampleCsvFileSource {
    async fn stream(&self) -> EnvelopeStream<Sample> {
        // Blocking reader inside one task; backfill files are read once, offline.
        // A bad row is reported on its own; only open/IO failures end the stream.
        let path = self.path.clone();
        let s = async_stream::stream! {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to open CSV file: {e}")));
                    return;
                }
            };
            let mut rdr = csv::Reader::from_reader(file);
            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to read CSV headers: {e}")));
                    return;
                }
            };

            for result in rdr.records() {
                let record = match result {
                    Ok(r) => r,
                    Err(e) => {
                        let fatal = matches!(e.kind(), csv::ErrorKind::Io(_));
                        metrics::counter!("sample_csv_parse_errors_total").increment(1);
                        yield Err(PipelineError::Source(format!("failed to read CSV record: {e}")));
                        if fatal {
                            return;
                        }
                        continue;
                    }
                };

                let received_at = SystemTime::now();
                match record_to_sample(&record, &headers, received_at) {
                    Ok(sample) => {
                        yield Ok(Envelope {
                            payload: sample,
                            received_at,
                        });
                    }
                    Err(e) => {
                        metrics::counter!("sample_csv_parse_errors_total").increment(1);
                        let line = record.position().map(|p| p.line()).unwrap_or_default();
                        yield Err(PipelineError::Source(format!("line {line}: {e}")));
                    }
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::{io::Write, time::Duration};

    #[test]
    fn blank_timestamp_falls_back_to_receive_time() {
        let headers = StringRecord::from(vec!["timestamp", "count"]);
        let record = StringRecord::from(vec!["", "42"]);
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let sample = record_to_sample(&record, &headers, at).unwrap();
        assert_eq!(sample, Sample::new(1_700_000_000, 42));
    }

    #[test]
    fn missing_count_column_is_rejected() {
        let headers = StringRecord::from(vec!["timestamp"]);
        let record = StringRecord::from(vec!["1700000000"]);
        assert!(record_to_sample(&record, &headers, SystemTime::now()).is_err());
    }

    #[tokio::test]
    async fn reads_rows_in_file_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timestamp,count").unwrap();
        writeln!(file, "1700000000,100").unwrap();
        writeln!(file, "1700000060,103").unwrap();

        let source = SampleCsvFileSource::new(file.path());
        let items: Vec<_> = source.stream().await.collect().await;

        let samples: Vec<Sample> = items.into_iter().map(|r| r.unwrap().payload).collect();
        assert_eq!(
            samples,
            vec![Sample::new(1_700_000_000, 100), Sample::new(1_700_000_060, 103)]
        );
    }

    #[tokio::test]
    async fn bad_row_in_the_middle_does_not_hide_later_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timestamp,count").unwrap();
        writeln!(file, "1700000000,1").unwrap();
        writeln!(file, "1700000060,abc").unwrap();
        writeln!(file, "1700000120,3").unwrap();

        let source = SampleCsvFileSource::new(file.path());
        let items: Vec<_> = source.stream().await.collect().await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(PipelineError::Source(msg)) if msg.starts_with("line 3")));
        assert_eq!(items[2].as_ref().unwrap().payload, Sample::new(1_700_000_120, 3));
    }
}
