//! Extraction of power readings from `powermetrics` free-text output.
//!
//! The log has no schema. Two kinds of lines carry readings:
//! direct ones that name their channel (`CPU Power: 4120 mW`), and
//! `Average power: ...` lines that belong to whichever channel header
//! was seen last.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("ansi pattern"));

static SECTION_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(CPU|GPU|ANE)\b").expect("section pattern"));

static AVERAGE_POWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Average power:\s*([\d.]+)\s*(m?W)").expect("average pattern")
});

static DIRECT_POWER: LazyLock<[(Channel, Regex); 3]> = LazyLock::new(|| {
    Channel::ALL.map(|channel| {
        let pattern = format!(r"(?i){}.*?Power:\s*([\d.]+)\s*(m?W)", channel.label());
        (channel, Regex::new(&pattern).expect("direct pattern"))
    })
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Cpu,
    Gpu,
    Ane,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Cpu, Channel::Gpu, Channel::Ane];

    pub fn label(&self) -> &'static str {
        match self {
            Channel::Cpu => "CPU",
            Channel::Gpu => "GPU",
            Channel::Ane => "ANE",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_uppercase().as_str() {
            "CPU" => Some(Channel::Cpu),
            "GPU" => Some(Channel::Gpu),
            "ANE" => Some(Channel::Ane),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub channel: Channel,
    pub watts: f64,
}

/// Watt readings per channel, in log order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSeries {
    pub cpu: Vec<f64>,
    pub gpu: Vec<f64>,
    pub ane: Vec<f64>,
}

impl ChannelSeries {
    pub fn get(&self, channel: Channel) -> &[f64] {
        match channel {
            Channel::Cpu => &self.cpu,
            Channel::Gpu => &self.gpu,
            Channel::Ane => &self.ane,
        }
    }

    pub fn push(&mut self, sample: PowerSample) {
        match sample.channel {
            Channel::Cpu => self.cpu.push(sample.watts),
            Channel::Gpu => self.gpu.push(sample.watts),
            Channel::Ane => self.ane.push(sample.watts),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.gpu.is_empty() && self.ane.is_empty()
    }
}

pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

/// Converts a captured number/unit pair to watts. `None` for malformed input.
fn to_watts(number: &str, unit: &str) -> Option<f64> {
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    if unit.eq_ignore_ascii_case("mw") {
        Some(value / 1000.0)
    } else {
        Some(value)
    }
}

fn capture_watts(re: &Regex, line: &str) -> Option<f64> {
    let caps = re.captures(line)?;
    to_watts(caps.get(1)?.as_str(), caps.get(2)?.as_str())
}

/// Line-at-a-time parser. The only state is the current section, which
/// changes only when a line starts with a channel label.
#[derive(Debug, Default)]
pub struct TelemetryParser {
    section: Option<Channel>,
    series: ChannelSeries,
}

impl TelemetryParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(&self) -> Option<Channel> {
        self.section
    }

    /// Feeds one raw line and returns the samples it produced.
    pub fn feed_line(&mut self, raw: &str) -> Vec<PowerSample> {
        let cleaned = strip_ansi(raw);
        let line = cleaned.trim();
        let mut samples = Vec::new();

        if let Some(caps) = SECTION_HEADER.captures(line) {
            self.section = caps.get(1).and_then(|m| Channel::from_label(m.as_str()));
        }

        for (channel, re) in DIRECT_POWER.iter() {
            if let Some(watts) = capture_watts(re, line) {
                samples.push(PowerSample {
                    channel: *channel,
                    watts,
                });
            }
        }

        if let Some(channel) = self.section {
            if let Some(watts) = capture_watts(&AVERAGE_POWER, line) {
                samples.push(PowerSample { channel, watts });
            }
        }

        for sample in &samples {
            self.series.push(*sample);
        }
        samples
    }

    pub fn finish(self) -> ChannelSeries {
        self.series
    }
}

pub fn parse_log_text(text: &str) -> ChannelSeries {
    let mut parser = TelemetryParser::new();
    for line in text.lines() {
        parser.feed_line(line);
    }
    parser.finish()
}

/// Parses a log file. A missing or unreadable file yields empty series.
pub fn parse_log_file(path: &Path) -> ChannelSeries {
    match std::fs::read(path) {
        Ok(bytes) => {
            let series = parse_log_text(&String::from_utf8_lossy(&bytes));
            debug!(
                path = %path.display(),
                cpu = series.cpu.len(),
                gpu = series.gpu.len(),
                ane = series.ane.len(),
                "Parsed power log"
            );
            series
        }
        Err(e) => {
            warn!("Power log not readable at {}: {}", path.display(), e);
            ChannelSeries::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_milliwatts_match_watts() {
        for x in [0.0, 1.0, 850.0, 4120.5, 123456.0] {
            let mw = parse_log_text(&format!("CPU Power: {} mW", x));
            let w = parse_log_text(&format!("CPU Power: {} W", x / 1000.0));
            assert_eq!(mw.cpu.len(), 1);
            assert!(close(mw.cpu[0], w.cpu[0]), "{} mW", x);
        }
    }

    #[test]
    fn test_section_state_carries_across_lines() {
        let log = "CPU temperature: 50C\nAverage power: 850 mW\nGPU foo\nAverage power: 2.1 W\n";
        let series = parse_log_text(log);
        assert_eq!(series.cpu.len(), 1);
        assert!(close(series.cpu[0], 0.85));
        assert_eq!(series.gpu, vec![2.1]);
        assert!(series.ane.is_empty());
    }

    #[test]
    fn test_average_without_section_is_ignored() {
        let series = parse_log_text("Average power: 900 mW\n");
        assert!(series.is_empty());
    }

    #[test]
    fn test_section_persists_until_next_header() {
        let log = "GPU HW active residency: 12%\n\
                   Average power: 1 W\n\
                   some unrelated line\n\
                   Average power: 3 W\n\
                   ANE block\n\
                   Average power: 500 mW\n";
        let series = parse_log_text(log);
        assert_eq!(series.gpu, vec![1.0, 3.0]);
        assert_eq!(series.ane, vec![0.5]);
    }

    #[test]
    fn test_direct_readings_ignore_section() {
        let log = "GPU section\nCPU Power: 4120 mW\nGPU Power: 37 mW\nANE Power: 0 mW\nCombined Power (CPU + GPU + ANE): 4157 mW\n";
        let series = parse_log_text(log);
        assert!(close(series.cpu[0], 4.12));
        assert!(close(series.gpu[0], 0.037));
        assert_eq!(series.ane[0], 0.0);
        // "Combined Power (CPU + ...)" has no "Power:" after any label.
        assert_eq!(series.cpu.len(), 1);
        assert_eq!(series.gpu.len(), 1);
        assert_eq!(series.ane.len(), 1);
    }

    #[test]
    fn test_both_rules_on_one_line() {
        let samples = TelemetryParser::new().feed_line("CPU Average power: 2 W");
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.channel == Channel::Cpu && s.watts == 2.0));
    }

    #[test]
    fn test_case_insensitive_units_and_labels() {
        let series = parse_log_text("cpu power: 1500 MW\ngpu Power: 2 w\n");
        assert!(close(series.cpu[0], 1.5));
        assert_eq!(series.gpu, vec![2.0]);
    }

    #[test]
    fn test_ansi_sequences_do_not_change_result() {
        let clean = "CPU Power: 1200 mW\nGPU Power: 300 mW\nGPU idle\nAverage power: 2 W\n";
        let noisy = "\x1b[2J\x1b[HCPU Power: 1200 mW\x1b[K\n\x1b[1;1HGPU Power: 300 mW\n\x1b[0mGPU idle\nAverage power: \x1b[1m2\x1b[0m W\n";
        assert_eq!(parse_log_text(noisy), parse_log_text(clean));
    }

    #[test]
    fn test_malformed_numbers_are_skipped() {
        let log = "CPU Power: 1.2.3 W\nCPU Power: . mW\nCPU Power: 7 W\nGPU Power: n/a\n";
        let series = parse_log_text(log);
        assert_eq!(series.cpu, vec![7.0]);
        assert!(series.gpu.is_empty());
    }

    #[test]
    fn test_header_tracking() {
        let mut parser = TelemetryParser::new();
        assert_eq!(parser.section(), None);
        parser.feed_line("**** Processor usage ****");
        assert_eq!(parser.section(), None);
        parser.feed_line("  GPU HW active frequency: 389 MHz");
        assert_eq!(parser.section(), Some(Channel::Gpu));
        parser.feed_line("CPUs are busy");
        assert_eq!(parser.section(), Some(Channel::Gpu));
    }

    #[test]
    fn test_missing_file_yields_empty_series() {
        let dir = tempfile::tempdir().unwrap();
        let series = parse_log_file(&dir.path().join("absent.log"));
        assert!(series.is_empty());
    }

    #[test]
    fn test_parse_file_tolerates_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power.log");
        let mut bytes = b"CPU Power: 900 mW\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b'\n']);
        bytes.extend_from_slice(b"GPU Power: 1 W\n");
        std::fs::write(&path, bytes).unwrap();
        let series = parse_log_file(&path);
        assert!(close(series.cpu[0], 0.9));
        assert_eq!(series.gpu, vec![1.0]);
    }
}
