use regex::Regex;
use std::sync::LazyLock;

const FALLBACK_MAX_CHARS: usize = 20_000;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid regex"));
static HTML_DOCUMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<html.*?</html>").expect("valid regex"));
static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```(?:html)?\s*(.*?)```").expect("valid regex"));

/// Pulls a renderable page out of a model's answer.
///
/// Reasoning blocks are dropped first. A literal `<html>` document wins,
/// then a fenced block that contains one. Anything else is shown verbatim
/// (JSON-escaped, capped) inside a `<pre>`.
pub fn extract_html(text: &str) -> String {
    let text = THINK_BLOCK.replace_all(text, "");

    if let Some(m) = HTML_DOCUMENT.find(&text) {
        return m.as_str().to_string();
    }

    if let Some(block) = FENCED_BLOCK.captures(&text).and_then(|c| c.get(1)) {
        let block = block.as_str().trim();
        if block.to_lowercase().contains("<html") {
            return block.to_string();
        }
    }

    let escaped = serde_json::to_string(&*text).unwrap_or_default();
    let capped: String = escaped.chars().take(FALLBACK_MAX_CHARS).collect();
    format!(
        "<!doctype html><html><head><meta charset='utf-8'><title>Output</title></head><body><pre>{}</pre></body></html>",
        escape_html(&capped)
    )
}

/// Escapes text for use inside an element body.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_html_document() {
        let text = "Sure!\n<!doctype html>\n<HTML lang=\"en\"><body>hi</body></HTML>\nEnjoy.";
        assert_eq!(
            extract_html(text),
            "<HTML lang=\"en\"><body>hi</body></HTML>"
        );
    }

    #[test]
    fn test_think_block_is_ignored() {
        let text = "<think>maybe <html>draft</html></think>```html\n<html><p>final</p></html>\n```";
        assert_eq!(extract_html(text), "<html><p>final</p></html>");
    }

    #[test]
    fn test_fenced_block_without_document_falls_back() {
        let out = extract_html("```js\nconsole.log(1)\n```");
        assert!(out.starts_with("<!doctype html>"));
        assert!(out.contains("console.log(1)"));
    }

    #[test]
    fn test_fallback_is_escaped_and_capped() {
        let out = extract_html("a <b> \"quoted\"");
        assert!(out.contains("&lt;b&gt;"));
        assert!(!out.contains("<b>"));

        let long = "y".repeat(30_000);
        let out = extract_html(&long);
        let body = out
            .split("<pre>")
            .nth(1)
            .and_then(|s| s.split("</pre>").next())
            .unwrap();
        assert_eq!(body.chars().count(), FALLBACK_MAX_CHARS);
    }
}
