use std::collections::BTreeMap;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::HailstormError;

/// What the orchestrator needs to know about one test-plan file.
#[derive(Debug, Clone, Default)]
pub struct ParsedPlan {
    /// Total virtual users across the plan's thread groups.
    pub threads_count: u32,
    /// Plan-scoped property overrides.
    pub properties: BTreeMap<String, String>,
    /// Data files the plan reads, named relative to the bundle directory.
    pub data_files: Vec<String>,
}

/// The test-plan parser seam: given a plan file, yields thread count,
/// properties and the data-file list.
pub trait PlanParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedPlan, HailstormError>;
}

// ---------------------------------------------------------------------------
// JmxPlanParser
// ---------------------------------------------------------------------------

/// Parser for JMeter `.jmx` plans. Reads `ThreadGroup.num_threads` string
/// props (summed across enabled thread groups) and CSV data-set `filename`
/// props.
#[derive(Debug, Clone, Default)]
pub struct JmxPlanParser;

impl PlanParser for JmxPlanParser {
    fn parse(&self, path: &Path) -> Result<ParsedPlan, HailstormError> {
        let content = std::fs::read_to_string(path)?;
        let mut reader = Reader::from_str(&content);
        reader.config_mut().trim_text(true);

        let mut parsed = ParsedPlan::default();
        let mut pending: Option<PendingProp> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(element)) if element.name().as_ref() == b"stringProp" => {
                    let name = element
                        .attributes()
                        .flatten()
                        .find(|attr| attr.key.as_ref() == b"name")
                        .and_then(|attr| attr.unescape_value().ok())
                        .map(|v| v.into_owned());
                    pending = match name.as_deref() {
                        Some("ThreadGroup.num_threads") => Some(PendingProp::Threads),
                        Some("filename") => Some(PendingProp::DataFile),
                        _ => None,
                    };
                }
                Ok(Event::Text(text)) => {
                    if let Some(prop) = pending.take() {
                        let value = text
                            .unescape()
                            .map(|v| v.into_owned())
                            .unwrap_or_default();
                        match prop {
                            PendingProp::Threads => {
                                parsed.threads_count +=
                                    value.trim().parse::<u32>().unwrap_or(0);
                            }
                            PendingProp::DataFile => {
                                let trimmed = value.trim();
                                if !trimmed.is_empty() {
                                    // Only the file name matters; plans often
                                    // carry absolute authoring-machine paths.
                                    let file_name = trimmed
                                        .rsplit(['/', '\\'])
                                        .next()
                                        .unwrap_or(trimmed)
                                        .to_string();
                                    if !parsed.data_files.contains(&file_name) {
                                        parsed.data_files.push(file_name);
                                    }
                                }
                            }
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    pending = None;
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(HailstormError::Configuration(format!(
                        "malformed plan file {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        Ok(parsed)
    }
}

enum PendingProp {
    Threads,
    DataFile,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
