//! Output post-processing: line filters and ANSI stripping

use regex::Regex;
use warden_foundation::{Error, Result};

/// Keeps only the lines matching a regex
#[derive(Debug, Clone)]
pub struct OutputFilter {
    regex: Regex,
}

impl OutputFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::InvalidInput(format!("invalid output filter '{}': {}", pattern, e)))?;
        Ok(Self { regex })
    }

    /// Compile an optional pattern; `None` passes everything through
    pub fn compile(pattern: Option<&str>) -> Result<Option<Self>> {
        pattern.map(Self::new).transpose()
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// Matching lines, each keeping its line terminator
    pub fn apply(&self, text: &str) -> String {
        text.split_inclusive('\n')
            .filter(|line| self.regex.is_match(line.trim_end_matches(['\n', '\r'])))
            .collect()
    }
}

/// Apply an optional filter
pub fn filter_text(text: String, filter: Option<&OutputFilter>) -> String {
    match filter {
        Some(filter) => filter.apply(&text),
        None => text,
    }
}

/// Remove ANSI escape sequences
pub fn strip_ansi(text: &str) -> String {
    strip_ansi_escapes::strip_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_keeps_matching_lines() {
        let filter = OutputFilter::new(r"^error").unwrap();
        let text = "warning: a\nerror: b\nok\nerror: c";
        assert_eq!(filter.apply(text), "error: b\nerror: c");
    }

    #[test]
    fn test_filter_handles_crlf() {
        let filter = OutputFilter::new(r"done$").unwrap();
        assert_eq!(filter.apply("step\r\ndone\r\n"), "done\r\n");
    }

    #[test]
    fn test_invalid_filter() {
        assert!(matches!(
            OutputFilter::new("([a-"),
            Err(Error::InvalidInput(_))
        ));
        assert!(OutputFilter::compile(None).unwrap().is_none());
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m plain"), "red plain");
        assert_eq!(filter_text("a\nb\n".to_string(), None), "a\nb\n");
    }
}
