use crate::error::EngineError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn build(code: &str, message: impl Into<String>, hint: Option<&str>) -> ErrorPayload {
    ErrorPayload {
        code: code.to_string(),
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        hint: hint.map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
    }
}

pub fn from_error(err: &EngineError) -> ErrorPayload {
    let message = match err {
        // Keep the whole context chain for internal failures; it is the only clue operators get.
        EngineError::Internal(e) => format_error_chain(e),
        other => other.to_string(),
    };
    build(err.code(), message, err.hint())
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_truncates_message() {
        let long = "a".repeat(MAX_MESSAGE_BYTES + 1024);
        let p = build("test", long, None);
        assert!(p.message.len() <= MAX_MESSAGE_BYTES);
        assert!(p.message.ends_with("…(truncated)"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_utf8(&s, 21);
        assert!(out.ends_with("…(truncated)"));
        assert!(out.len() <= 21 + "é".len());
    }

    #[test]
    fn from_error_carries_code_and_hint() {
        let p = from_error(&EngineError::NotRunning);
        assert_eq!(p.code, "not_running");
        assert_eq!(p.message, "server is not running");
        assert!(p.hint.is_some());

        let v = serde_json::to_value(from_error(&EngineError::invalid_path("x"))).unwrap();
        assert_eq!(v["code"], "invalid_path");
        assert!(v.get("hint").is_none());
    }

    #[test]
    fn error_chain_skips_duplicates() {
        use anyhow::Context;
        let err = Err::<(), _>(std::io::Error::other("denied"))
            .context("open archive")
            .unwrap_err();
        assert_eq!(format_error_chain(&err), "open archive: denied");
    }
}
