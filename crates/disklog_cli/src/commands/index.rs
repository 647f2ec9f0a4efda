//! Index command implementation.

use super::open_log;
use disklog_core::index::OPEN_END;
use disklog_core::DiskLog;
use serde::Serialize;
use std::path::Path;

/// Segment index report.
#[derive(Debug, Serialize)]
pub struct IndexReport {
    /// Log directory.
    pub path: String,
    /// Smallest seqno, if the log holds events.
    pub min_seqno: Option<u64>,
    /// Largest complete seqno, if the log holds events.
    pub max_seqno: Option<u64>,
    /// Total size of all segments in bytes.
    pub total_size: u64,
    /// One entry per segment, oldest first.
    pub segments: Vec<SegmentInfo>,
}

/// One segment in the report.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// File name.
    pub file: String,
    /// First seqno.
    pub start_seqno: u64,
    /// Last seqno, absent for the active segment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_seqno: Option<u64>,
    /// File size in bytes.
    pub size: u64,
}

/// Runs the index command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let log = open_log(path, false)?;
    let report = build_report(&log)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

fn build_report(log: &DiskLog) -> Result<IndexReport, Box<dyn std::error::Error>> {
    let mut segments = Vec::new();
    for entry in log.index_entries() {
        let size = std::fs::metadata(log.dir().join(&entry.file_name))?.len();
        segments.push(SegmentInfo {
            end_seqno: (entry.end_seqno != OPEN_END).then_some(entry.end_seqno),
            file: entry.file_name,
            start_seqno: entry.start_seqno,
            size,
        });
    }
    Ok(IndexReport {
        path: log.dir().display().to_string(),
        min_seqno: log.min_seqno(),
        max_seqno: log.max_seqno(),
        total_size: segments.iter().map(|s| s.size).sum(),
        segments,
    })
}

fn print_text_output(report: &IndexReport) {
    println!("Log: {}", report.path);
    match (report.min_seqno, report.max_seqno) {
        (Some(min), Some(max)) => println!("Seqnos: {min} - {max}"),
        _ => println!("Seqnos: (empty)"),
    }
    println!("Segments: {}", report.segments.len());
    println!("Total size: {} bytes", report.total_size);
    println!();
    for segment in &report.segments {
        let end = segment
            .end_seqno
            .map_or_else(|| "open".to_string(), |e| e.to_string());
        println!(
            "  {:<22} {:>12} - {:<12} {:>12} bytes",
            segment.file, segment.start_seqno, end, segment.size
        );
    }
}
