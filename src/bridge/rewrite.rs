//! Workspace path translation for protocol payloads.
//!
//! Only JSON string literals (values and object keys) are inspected. A string is
//! rewritten when it starts with the source root, either bare or as a
//! `file://` URI, and the root is followed by `/` or the end of the string.
//! Everything else in the payload is left byte-for-byte alone.

use std::borrow::Cow;

use serde::de::IgnoredAny;

const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRewriter {
    from: String,
    to: String,
}

impl PathRewriter {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: normalize_root(from),
            to: normalize_root(to),
        }
    }

    /// The rewriter for the opposite direction.
    pub fn inverse(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
        }
    }

    /// Rewritten form of `s`, or `None` if it does not refer to the root.
    pub fn rewrite_str(&self, s: &str) -> Option<String> {
        if let Some(rest) = s.strip_prefix(FILE_SCHEME) {
            return self
                .rewrite_path(rest)
                .map(|path| format!("{}{}", FILE_SCHEME, path));
        }
        self.rewrite_path(s)
    }

    fn rewrite_path(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(self.from.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(format!("{}{}", self.to, rest))
        } else {
            None
        }
    }

    /// Rewrite a serialized message. Text that is not JSON, or that contains
    /// no references to the root, is returned unchanged. Only the string
    /// literals that change are replaced; numbers, escapes and whitespace
    /// elsewhere keep their original spelling.
    pub fn rewrite_message<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if !text.contains(self.from.as_str()) {
            return Cow::Borrowed(text);
        }
        if serde_json::from_str::<IgnoredAny>(text).is_err() {
            return Cow::Borrowed(text);
        }

        let bytes = text.as_bytes();
        let mut out = String::new();
        let mut copied = 0;
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != b'"' {
                i += 1;
                continue;
            }
            let start = i;
            let mut escaped = false;
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                if bytes[i] == b'\\' {
                    escaped = true;
                    i += 1;
                }
                i += 1;
            }
            let end = i.min(bytes.len() - 1);
            i += 1;

            let literal = &text[start..=end];
            let decoded: Cow<'_, str> = if escaped {
                match serde_json::from_str::<String>(literal) {
                    Ok(s) => Cow::Owned(s),
                    Err(_) => continue,
                }
            } else {
                Cow::Borrowed(&literal[1..literal.len() - 1])
            };
            let Some(rewritten) = self.rewrite_str(&decoded) else {
                continue;
            };
            let Ok(encoded) = serde_json::to_string(&rewritten) else {
                return Cow::Borrowed(text);
            };
            out.push_str(&text[copied..start]);
            out.push_str(&encoded);
            copied = end + 1;
        }

        if copied == 0 {
            return Cow::Borrowed(text);
        }
        out.push_str(&text[copied..]);
        Cow::Owned(out)
    }
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
