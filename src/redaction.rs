use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r#"(?i)(sk-[A-Za-z0-9]{20,}|Bearer\s+[^\s"]+|"(access_token|refresh_token|token)"\s*:\s*"[^"]*")"#
    )
    .expect("Invalid redaction regex");
}

pub fn redact(input: &str) -> std::borrow::Cow<'_, str> {
    REDACTION_REGEX.replace_all(input, "[REDACTED]")
}

/// Log sink wrapper that scrubs credentials before they reach disk.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        self.inner.write_all(redact(&input).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_and_token_fields_are_scrubbed() {
        let line = r#"POST /chat/stream Authorization: Bearer eyJhbGciOi.abc {"token":"s3cret","model":"m"}"#;
        let out = redact(line);
        assert!(!out.contains("eyJhbGciOi"));
        assert!(!out.contains("s3cret"));
        assert!(out.contains(r#""model":"m""#));
    }

    #[test]
    fn test_writer_reports_original_length() {
        let mut sink = Vec::new();
        let mut writer = RedactingWriter::new(&mut sink);
        let input = b"key sk-abcdefghijklmnopqrstuvwxyz0123";
        let written = writer.write(input).expect("write");
        assert_eq!(written, input.len());
        assert_eq!(String::from_utf8_lossy(&sink), "key [REDACTED]");
    }
}
