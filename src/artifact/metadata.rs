//! Wheel `METADATA` parsing.
//!
//! The file is an RFC 822 style header block: `Name: value` lines, values
//! continued on lines starting with whitespace, keys may repeat, and an
//! optional free-text body after the first blank line.

/// Parsed contents of a wheel's `METADATA` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WheelMetadata {
    headers: Vec<(String, String)>,
    body: String,
}

impl WheelMetadata {
    pub fn parse(text: &str) -> Self {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut lines = text.lines();
        let mut body_lines = Vec::new();

        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = headers.last_mut() {
                    value.push('\n');
                    value.push_str(line.trim());
                }
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_string(), value.trim().to_string()))
                }
                None => tracing::debug!(line, "Ignoring malformed metadata line"),
            }
        }
        body_lines.extend(lines);

        Self {
            headers,
            body: body_lines.join("\n"),
        }
    }

    /// First value of a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of a repeated header, in file order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn name(&self) -> Option<&str> {
        self.get("Name")
    }

    pub fn version(&self) -> Option<&str> {
        self.get("Version")
    }

    /// Declared runtime requirements
    pub fn requires_dist(&self) -> Vec<&str> {
        self.get_all("Requires-Dist")
    }

    /// Long description following the headers
    pub fn body(&self) -> &str {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Metadata-Version: 2.1\n\
Name: foo\n\
Version: 0.1\n\
Summary: A package\n\
 spanning two lines\n\
Requires-Dist: bar (>=1.0)\n\
requires-dist: baz\n\
\n\
Long description.\n\
\n\
More text.";

    #[test]
    fn test_headers() {
        let meta = WheelMetadata::parse(SAMPLE);
        assert_eq!(meta.name(), Some("foo"));
        assert_eq!(meta.version(), Some("0.1"));
        assert_eq!(meta.get("metadata-version"), Some("2.1"));
        assert_eq!(meta.get("Summary"), Some("A package\nspanning two lines"));
        assert_eq!(meta.get("License"), None);
    }

    #[test]
    fn test_repeated_headers_keep_order() {
        let meta = WheelMetadata::parse(SAMPLE);
        assert_eq!(meta.requires_dist(), vec!["bar (>=1.0)", "baz"]);
    }

    #[test]
    fn test_body() {
        let meta = WheelMetadata::parse(SAMPLE);
        assert_eq!(meta.body(), "Long description.\n\nMore text.");
        assert_eq!(WheelMetadata::parse("Name: x\n").body(), "");
    }
}
