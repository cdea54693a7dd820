//! Shell-style key patterns
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `*` | any run of characters except `/` |
//! | `**` | any run of characters, `/` included |
//! | `?` | one character except `/` |
//! | `[abc]`, `[a-z]`, `[!abc]` | one character from (or not from) a class |
//! | `{csv,tsv}` | any of the comma-separated alternatives |
//! | `\x` | literal `x` |

use regex::Regex;

/// A compiled key pattern
#[derive(Debug, Clone)]
pub struct KeyPattern {
    regex: Regex,
}

impl KeyPattern {
    /// Compile `pattern`; the error describes what is malformed
    pub fn new(pattern: &str) -> Result<Self, String> {
        let source = translate(pattern)?;
        let regex = Regex::new(&source).map_err(|e| e.to_string())?;
        Ok(Self { regex })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

fn translate(pattern: &str) -> Result<String, String> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    let mut depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if matches!(c, '\\' | '[' | '&' | '~') {
                        out.push('\\');
                    }
                    out.push(c);
                }
                if !closed {
                    return Err(format!("unclosed '[' in pattern '{}'", pattern));
                }
                out.push(']');
            }
            '{' => {
                depth += 1;
                out.push_str("(?:");
            }
            ',' if depth > 0 => out.push('|'),
            '}' if depth > 0 => {
                depth -= 1;
                out.push(')');
            }
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| format!("trailing '\\' in pattern '{}'", pattern))?;
                out.push_str(&regex::escape(&escaped.to_string()));
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    if depth > 0 {
        return Err(format!("unclosed '{{' in pattern '{}'", pattern));
    }
    out.push('$');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, key: &str) -> bool {
        KeyPattern::new(pattern).unwrap().matches(key)
    }

    #[test]
    fn test_star_stays_in_segment() {
        assert!(matches("*.csv", "a.csv"));
        assert!(!matches("*.csv", "dir/a.csv"));
        assert!(matches("dir/*.csv", "dir/a.csv"));
        assert!(!matches("*.csv", "a.csv.gz"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        assert!(matches("**.csv", "x/y/a.csv"));
        assert!(matches("logs/**", "logs/2019/01/a.csv"));
        assert!(!matches("logs/**", "other/a.csv"));
    }

    #[test]
    fn test_question_and_classes() {
        assert!(matches("part-?.csv", "part-1.csv"));
        assert!(!matches("part-?.csv", "part-12.csv"));
        assert!(matches("part-[0-3].csv", "part-2.csv"));
        assert!(!matches("part-[!0-3].csv", "part-2.csv"));
        assert!(matches("part-[!0-3].csv", "part-7.csv"));
    }

    #[test]
    fn test_alternatives_and_literals() {
        assert!(matches("a.{csv,parquet}", "a.parquet"));
        assert!(!matches("a.{csv,parquet}", "a.json"));
        assert!(matches("a+b(1).csv", "a+b(1).csv"));
        assert!(matches(r"a\*.csv", "a*.csv"));
        assert!(!matches(r"a\*.csv", "ab.csv"));
    }

    #[test]
    fn test_malformed_patterns() {
        assert!(KeyPattern::new("part-[0-3.csv").is_err());
        assert!(KeyPattern::new("a.{csv,tsv").is_err());
        assert!(KeyPattern::new("a\\").is_err());
    }
}
