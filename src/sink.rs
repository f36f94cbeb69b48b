//! Result sinks: streamed lines, collect-then-sort, and tabular CSV records.
use crate::error::{PipelineError, Result};
use crate::types::ScanResult;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Which sink the caller wants.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Stream,
    Sorted,
    Csv {
        path: PathBuf,
        /// Also print each persisted record as a stream line.
        #[serde(default)]
        echo: bool,
    },
}

/// Consumer at the end of the pipeline.
pub trait ResultSink: Send {
    fn accept(&mut self, result: &ScanResult) -> Result<()>;

    /// Called once after the input completed without a sink error.
    fn finish(&mut self) -> Result<()>;
}

/// `"<port> - open"` style line; host-qualified when scanning several hosts.
pub fn format_line(result: &ScanResult, show_host: bool) -> String {
    let target = if show_host {
        result.task.to_string()
    } else {
        result.port().to_string()
    };
    if result.open {
        format!("{target} - open")
    } else {
        format!("{target} - closed ({})", result.error_detail())
    }
}

/// Writes each result as it arrives. No buffering beyond the writer's own.
pub struct StreamSink<W: Write + Send> {
    out: W,
    show_host: bool,
}

impl StreamSink<io::Stdout> {
    pub fn stdout(show_host: bool) -> Self {
        Self::new(io::stdout(), show_host)
    }
}

impl<W: Write + Send> StreamSink<W> {
    pub fn new(out: W, show_host: bool) -> Self {
        Self { out, show_host }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ResultSink for StreamSink<W> {
    fn accept(&mut self, result: &ScanResult) -> Result<()> {
        writeln!(self.out, "{}", format_line(result, self.show_host))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Buffers everything, then emits results ordered by host and port.
pub struct SortedSink<W: Write + Send> {
    out: W,
    show_host: bool,
    results: Vec<ScanResult>,
}

impl SortedSink<io::Stdout> {
    pub fn stdout(show_host: bool) -> Self {
        Self::new(io::stdout(), show_host)
    }
}

impl SortedSink<io::Sink> {
    /// Collects results without printing anything.
    pub fn collector() -> Self {
        Self::new(io::sink(), false)
    }
}

impl<W: Write + Send> SortedSink<W> {
    pub fn new(out: W, show_host: bool) -> Self {
        Self {
            out,
            show_host,
            results: Vec::new(),
        }
    }

    /// Results received so far; sorted once `finish` ran.
    pub fn results(&self) -> &[ScanResult] {
        &self.results
    }

    pub fn into_parts(self) -> (W, Vec<ScanResult>) {
        (self.out, self.results)
    }
}

impl<W: Write + Send> ResultSink for SortedSink<W> {
    fn accept(&mut self, result: &ScanResult) -> Result<()> {
        self.results.push(result.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.results
            .sort_by(|a, b| (&a.task.host, a.port()).cmp(&(&b.task.host, b.port())));
        writeln!(self.out, "\nResults\n--------------")?;
        for r in &self.results {
            writeln!(self.out, "{}", format_line(r, self.show_host))?;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Persists one header record and one data record per result.
///
/// The host column is only present for multi-host scans. Once a write fails
/// the sink refuses further records.
pub struct CsvSink<W: Write + Send> {
    wtr: csv::Writer<W>,
    with_host: bool,
    header_written: bool,
    records: u64,
    failed: bool,
    echo: Option<Box<dyn Write + Send>>,
}

impl CsvSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>, with_host: bool) -> Result<Self> {
        let f = File::create(path.as_ref())?;
        Ok(Self::new(BufWriter::new(f), with_host))
    }
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(out: W, with_host: bool) -> Self {
        Self {
            wtr: csv::Writer::from_writer(out),
            with_host,
            header_written: false,
            records: 0,
            failed: false,
            echo: None,
        }
    }

    /// Echo each persisted record as a stream line to `out`.
    pub fn with_echo(mut self, out: Box<dyn Write + Send>) -> Self {
        self.echo = Some(out);
        self
    }

    /// Data records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> Result<W> {
        self.wtr
            .into_inner()
            .map_err(|e| PipelineError::SinkFlush(io::Error::other(e.error().to_string())))
    }

    fn header(&self) -> &'static [&'static str] {
        if self.with_host {
            &["host", "port", "open", "errorDetail", "elapsedDuration"]
        } else {
            &["port", "open", "errorDetail", "elapsedDuration"]
        }
    }

    fn write_header(&mut self, port: u16) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        let header = self.header();
        self.wtr.write_record(header).map_err(|source| {
            self.failed = true;
            PipelineError::SinkWrite {
                record: 0,
                port,
                source,
            }
        })?;
        self.header_written = true;
        Ok(())
    }
}

impl<W: Write + Send> ResultSink for CsvSink<W> {
    fn accept(&mut self, result: &ScanResult) -> Result<()> {
        if self.failed {
            return Err(PipelineError::SinkClosed);
        }
        self.write_header(result.port())?;

        let port = result.port().to_string();
        let open = result.open.to_string();
        let detail = result.error_detail();
        let elapsed = format!("{:?}", result.elapsed);
        let res = if self.with_host {
            self.wtr.write_record([
                result.task.host.as_str(),
                port.as_str(),
                open.as_str(),
                detail.as_str(),
                elapsed.as_str(),
            ])
        } else {
            self.wtr
                .write_record([port.as_str(), open.as_str(), detail.as_str(), elapsed.as_str()])
        };
        let record = self.records + 1;
        res.map_err(|source| {
            self.failed = true;
            warn!(record, port = result.port(), "csv write failed");
            PipelineError::SinkWrite {
                record,
                port: result.port(),
                source,
            }
        })?;
        self.records = record;

        if let Some(echo) = self.echo.as_mut() {
            writeln!(echo, "{}", format_line(result, self.with_host))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.failed {
            return Ok(());
        }
        // Header-only output for an empty run.
        self.write_header(0)?;
        if let Err(e) = self.wtr.flush() {
            self.failed = true;
            return Err(PipelineError::SinkFlush(e));
        }
        if let Some(echo) = self.echo.as_mut() {
            echo.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DialFailure, ErrorClass, ScanTask};
    use std::time::Duration;

    fn open(host: &str, port: u16) -> ScanResult {
        ScanResult::open(ScanTask::new(host, port), Duration::from_millis(3))
    }

    fn refused(port: u16) -> ScanResult {
        ScanResult::failed(
            ScanTask::new("127.0.0.1", port),
            DialFailure {
                class: ErrorClass::Refused,
                message: "Connection refused (os error 111)".into(),
            },
            Duration::from_micros(250),
        )
    }

    #[test]
    fn stream_prints_lines_in_arrival_order() {
        let mut sink = StreamSink::new(Vec::new(), false);
        sink.accept(&open("127.0.0.1", 443)).unwrap();
        sink.accept(&open("127.0.0.1", 22)).unwrap();
        sink.finish().unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "443 - open\n22 - open\n");
    }

    #[test]
    fn sorted_orders_by_port() {
        let mut sink = SortedSink::new(Vec::new(), false);
        for p in [8080, 22, 443] {
            sink.accept(&open("127.0.0.1", p)).unwrap();
        }
        sink.finish().unwrap();
        let ports: Vec<u16> = sink.results().iter().map(|r| r.port()).collect();
        assert_eq!(ports, vec![22, 443, 8080]);
        let (out, _) = sink.into_parts();
        let out = String::from_utf8(out).unwrap();
        assert!(out.ends_with("22 - open\n443 - open\n8080 - open\n"), "{out}");
    }

    #[test]
    fn sorted_orders_hosts_first() {
        let mut sink = SortedSink::new(Vec::new(), true);
        sink.accept(&open("b", 1)).unwrap();
        sink.accept(&open("a", 2)).unwrap();
        sink.finish().unwrap();
        let hosts: Vec<&str> = sink.results().iter().map(|r| r.task.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b"]);
    }

    #[test]
    fn csv_writes_header_then_rows() {
        let mut sink = CsvSink::new(Vec::new(), false);
        sink.accept(&open("127.0.0.1", 80)).unwrap();
        sink.accept(&refused(81)).unwrap();
        sink.finish().unwrap();
        assert_eq!(sink.records(), 2);
        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "port,open,errorDetail,elapsedDuration");
        assert_eq!(lines[1], "80,true,,3ms");
        assert_eq!(
            lines[2],
            "81,false,refused: Connection refused (os error 111),250µs"
        );
    }

    #[test]
    fn csv_multi_host_header() {
        let mut sink = CsvSink::new(Vec::new(), true);
        sink.finish().unwrap();
        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(out, "host,port,open,errorDetail,elapsedDuration\n");
    }

    /// Accepts `budget` bytes, then fails every write.
    struct Failing {
        budget: usize,
    }

    impl Write for Failing {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn csv_failure_aborts_remaining_writes() {
        let mut sink = CsvSink::new(Failing { budget: 64 }, false);
        let mut first_err = None;
        for p in 1..=2000u16 {
            if let Err(e) = sink.accept(&refused(p)) {
                first_err = Some(e);
                break;
            }
        }
        let err = match first_err {
            Some(e) => e,
            None => sink.finish().unwrap_err(),
        };
        assert!(
            matches!(err, PipelineError::SinkWrite { .. } | PipelineError::SinkFlush(_)),
            "{err}"
        );
        assert!(sink.accept(&refused(1)).is_err());
    }
}
