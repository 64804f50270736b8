//! Python signature scan feeding the test-generation prompt.

use std::sync::LazyLock;

use regex::Regex;

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+def|def|class)\s+[A-Za-z_][A-Za-z0-9_]*")
        .expect("header regex is valid")
});

static DECORATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*@[A-Za-z_]").expect("decorator regex is valid"));

/// Collect `def`, `async def` and `class` headers, each with the decorators
/// directly above it, in source order. Headers spanning several lines are
/// kept whole up to the closing `:`.
pub fn extract_signatures(source: &str) -> Vec<String> {
    let lines: Vec<&str> = source.lines().collect();
    let mut signatures = Vec::new();
    let mut decorators: Vec<&str> = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        let line = lines[idx];
        if DECORATOR_RE.is_match(line) {
            decorators.push(line.trim());
            idx += 1;
            continue;
        }
        if HEADER_RE.is_match(line) {
            let mut parts: Vec<&str> = std::mem::take(&mut decorators);
            let mut depth: i32 = 0;
            loop {
                let current = lines[idx];
                depth += paren_delta(current);
                parts.push(current.trim());
                let closed = depth <= 0 && strip_comment(current).trim_end().ends_with(':');
                idx += 1;
                if closed || idx >= lines.len() {
                    break;
                }
            }
            signatures.push(parts.join("\n"));
            continue;
        }
        if !line.trim().is_empty() && !line.trim_start().starts_with('#') {
            decorators.clear();
        }
        idx += 1;
    }
    signatures
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn paren_delta(line: &str) -> i32 {
    strip_comment(line).chars().fold(0, |acc, ch| match ch {
        '(' | '[' | '{' => acc + 1,
        ')' | ']' | '}' => acc - 1,
        _ => acc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
import functools

@functools.lru_cache(maxsize=None)
def fib(n: int) -> int:
    return n if n < 2 else fib(n - 1) + fib(n - 2)

class Greeter(Base):
    @property
    def name(self) -> str:  # display name
        return "x"

    async def greet(
        self,
        who: str,
    ) -> None:
        pass
"#;

    #[test]
    fn collects_headers_with_decorators_in_order() {
        let signatures = extract_signatures(SOURCE);
        assert_eq!(
            signatures,
            vec![
                "@functools.lru_cache(maxsize=None)\ndef fib(n: int) -> int:".to_string(),
                "class Greeter(Base):".to_string(),
                "@property\ndef name(self) -> str:  # display name".to_string(),
                "async def greet(\nself,\nwho: str,\n) -> None:".to_string(),
            ]
        );
    }

    #[test]
    fn decorators_do_not_leak_across_statements() {
        let source = "@decorator\nx = 1\ndef plain():\n    pass\n";
        assert_eq!(extract_signatures(source), vec!["def plain():".to_string()]);
    }

    #[test]
    fn empty_source_has_no_signatures() {
        assert!(extract_signatures("").is_empty());
    }
}
