use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::HailstormError;

/// One generator-side sample, normalised from either JTL flavour.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    /// Sample start, epoch milliseconds.
    pub timestamp_ms: i64,
    pub elapsed_ms: u64,
    pub label: String,
    pub success: bool,
    pub bytes: u64,
}

/// Read a JTL result file. JMeter writes either CSV (modern default) or the
/// XML format; the leading byte decides which parser runs.
pub fn read_jtl(path: impl AsRef<Path>) -> Result<Vec<SampleRecord>, HailstormError> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_jtl(&content)
}

pub fn parse_jtl(content: &str) -> Result<Vec<SampleRecord>, HailstormError> {
    if content.trim_start().starts_with('<') {
        parse_xml(content)
    } else {
        parse_csv(content)
    }
}

// ---------------------------------------------------------------------------
// CSV flavour
// ---------------------------------------------------------------------------

fn parse_csv(content: &str) -> Result<Vec<SampleRecord>, HailstormError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| HailstormError::Agent(format!("unreadable JTL header: {e}")))?
        .clone();
    let index_of = |name: &str, fallback: usize| -> usize {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .unwrap_or(fallback)
    };
    let ts_idx = index_of("timeStamp", 0);
    let elapsed_idx = index_of("elapsed", 1);
    let label_idx = index_of("label", 2);
    let success_idx = index_of("success", 7);
    let bytes_idx = index_of("bytes", 8);

    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| HailstormError::Agent(format!("bad JTL row: {e}")))?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();
        let (Ok(timestamp_ms), Ok(elapsed_ms)) = (
            field(ts_idx).parse::<i64>(),
            field(elapsed_idx).parse::<u64>(),
        ) else {
            continue;
        };
        samples.push(SampleRecord {
            timestamp_ms,
            elapsed_ms,
            label: field(label_idx).to_string(),
            success: field(success_idx).eq_ignore_ascii_case("true"),
            bytes: field(bytes_idx).parse().unwrap_or(0),
        });
    }
    Ok(samples)
}

// ---------------------------------------------------------------------------
// XML flavour
// ---------------------------------------------------------------------------

fn parse_xml(content: &str) -> Result<Vec<SampleRecord>, HailstormError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut samples = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Empty(element)) | Ok(Event::Start(element)) => {
                let name = element.name();
                if name.as_ref() != b"httpSample" && name.as_ref() != b"sample" {
                    continue;
                }
                let mut timestamp_ms = None;
                let mut elapsed_ms = None;
                let mut label = String::new();
                let mut success = false;
                let mut bytes = 0u64;
                for attr in element.attributes().flatten() {
                    let value = attr.unescape_value().unwrap_or_default();
                    match attr.key.as_ref() {
                        b"ts" => timestamp_ms = value.parse().ok(),
                        b"t" => elapsed_ms = value.parse().ok(),
                        b"lb" => label = value.into_owned(),
                        b"s" => success = value.eq_ignore_ascii_case("true"),
                        b"by" => bytes = value.parse().unwrap_or(0),
                        _ => {}
                    }
                }
                if let (Some(timestamp_ms), Some(elapsed_ms)) = (timestamp_ms, elapsed_ms) {
                    samples.push(SampleRecord {
                        timestamp_ms,
                        elapsed_ms,
                        label,
                        success,
                        bytes,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(HailstormError::Agent(format!("malformed XML JTL: {e}")));
            }
        }
    }
    Ok(samples)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
