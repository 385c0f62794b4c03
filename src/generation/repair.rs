//! Cleanup and repair of free-form model output.
//!
//! Models asked for JSON still wrap it in code fences, stop mid-document
//! when they hit the token ceiling, or fall into a loop repeating one
//! phrase. These helpers turn such output back into something parseable
//! or flag it so the attempt can be retried.

use serde_json::Value;

/// Shortest repeated segment counted as degeneration.
pub const MIN_DEGENERATE_SEGMENT: usize = 20;

/// Consecutive copies of the segment that count as degeneration.
pub const DEGENERATE_REPEATS: usize = 4;

/// Remove a wrapping code fence (with or without a `json` tag).
pub fn strip_code_fences(text: &str) -> &str {
    let mut s = text.trim();

    if let Some(rest) = s.strip_prefix("```") {
        let rest = match rest.get(..4) {
            Some(tag) if tag.eq_ignore_ascii_case("json") => &rest[4..],
            _ => rest,
        };
        s = rest.trim_start();
    }

    if let Some(rest) = s.strip_suffix("```") {
        s = rest.trim_end();
    }

    s
}

/// Find a segment of at least [`MIN_DEGENERATE_SEGMENT`] characters, without
/// newlines, repeated [`DEGENERATE_REPEATS`] or more times back to back.
///
/// Returns the period (segment length) of the first repetition found.
pub fn detect_degeneration(text: &str) -> Option<usize> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let needed_repeats = DEGENERATE_REPEATS - 1;

    let mut period = MIN_DEGENERATE_SEGMENT;
    while period * DEGENERATE_REPEATS <= n {
        // A run of `needed_repeats * period` positions where s[j] == s[j + period]
        // means the window is `period`-periodic across DEGENERATE_REPEATS copies.
        let target = needed_repeats * period;
        let mut run = 0;
        for j in 0..n - period {
            if chars[j] == chars[j + period] && chars[j] != '\n' {
                run += 1;
                if run >= target {
                    return Some(period);
                }
            } else {
                run = 0;
            }
        }
        period += 1;
    }

    None
}

fn parses(s: &str) -> bool {
    serde_json::from_str::<Value>(s).is_ok()
}

/// Repair a truncated JSON document.
///
/// Already-valid input is returned unchanged. Otherwise an unterminated
/// string is closed and open containers are closed in reverse order; if
/// that still does not parse, the document is cut back to the last complete
/// value and closed from there. Returns `None` when nothing parseable can be
/// recovered.
pub fn repair_truncated_json(input: &str) -> Option<String> {
    if parses(input) {
        return Some(input.to_string());
    }

    let closed = close_open_structures(input.trim());
    if parses(&closed) {
        return Some(closed);
    }

    cut_to_last_complete(input.trim())
}

/// Close an unterminated string, then any still-open `{`/`[`.
/// Unmatched closers are ignored.
pub fn close_open_structures(input: &str) -> String {
    let mut in_string = false;
    let mut escaped = false;
    let mut stack: Vec<char> = Vec::new();

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = input.to_string();
    if in_string {
        if escaped {
            // A lone trailing backslash would escape the closing quote.
            out.pop();
        }
        out.push('"');
    }
    out.extend(stack.iter().rev());
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Expect {
    Value,
    Key,
    Colon,
    CommaOrClose,
    End,
}

/// A prefix length after which appending `closers` (reversed) yields valid JSON.
struct SafePoint {
    end: usize,
    closers: Vec<char>,
}

fn cut_to_last_complete(input: &str) -> Option<String> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let n = chars.len();
    let byte_at = |i: usize| if i < n { chars[i].0 } else { input.len() };

    let mut stack: Vec<char> = Vec::new();
    let mut expect = Expect::Value;
    let mut may_close = false;
    let mut safe: Option<SafePoint> = None;
    // Set when input ends inside a value string: (cut byte offset, closers)
    let mut open_value_string: Option<(usize, Vec<char>)> = None;

    let mut i = 0;
    'scan: while i < n {
        let c = chars[i].1;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match expect {
            Expect::End => break,
            Expect::Colon => {
                if c != ':' {
                    break;
                }
                expect = Expect::Value;
                may_close = false;
                i += 1;
            }
            Expect::CommaOrClose => {
                if c == ',' {
                    expect = if stack.last() == Some(&'}') {
                        Expect::Key
                    } else {
                        Expect::Value
                    };
                    may_close = false;
                    i += 1;
                } else if stack.last() == Some(&c) {
                    stack.pop();
                    i += 1;
                    complete_value(&mut expect, &stack);
                    safe = Some(SafePoint {
                        end: byte_at(i),
                        closers: stack.clone(),
                    });
                } else {
                    break;
                }
            }
            Expect::Key | Expect::Value => {
                let is_key = expect == Expect::Key;

                if may_close && stack.last() == Some(&c) {
                    stack.pop();
                    i += 1;
                    complete_value(&mut expect, &stack);
                    safe = Some(SafePoint {
                        end: byte_at(i),
                        closers: stack.clone(),
                    });
                    continue;
                }

                if c == '"' {
                    i += 1;
                    loop {
                        if i >= n {
                            if !is_key {
                                open_value_string = Some((input.len(), stack.clone()));
                            }
                            break 'scan;
                        }
                        match chars[i].1 {
                            '"' => {
                                i += 1;
                                break;
                            }
                            '\\' => {
                                let escape_at = chars[i].0;
                                match chars.get(i + 1).map(|&(_, e)| e) {
                                    None => {
                                        if !is_key {
                                            open_value_string = Some((escape_at, stack.clone()));
                                        }
                                        break 'scan;
                                    }
                                    Some('u') => {
                                        if i + 5 >= n {
                                            if !is_key {
                                                open_value_string =
                                                    Some((escape_at, stack.clone()));
                                            }
                                            break 'scan;
                                        }
                                        let hex: String =
                                            chars[i + 2..i + 6].iter().map(|&(_, h)| h).collect();
                                        i += 6;
                                        let high_surrogate = u32::from_str_radix(&hex, 16)
                                            .map(|cp| (0xD800..0xDC00).contains(&cp))
                                            .unwrap_or(false);
                                        if high_surrogate && i >= n {
                                            // The low half was cut off
                                            if !is_key {
                                                open_value_string =
                                                    Some((escape_at, stack.clone()));
                                            }
                                            break 'scan;
                                        }
                                    }
                                    Some(_) => i += 2,
                                }
                            }
                            _ => i += 1,
                        }
                    }

                    if is_key {
                        expect = Expect::Colon;
                    } else {
                        complete_value(&mut expect, &stack);
                        safe = Some(SafePoint {
                            end: byte_at(i),
                            closers: stack.clone(),
                        });
                    }
                    continue;
                }

                if is_key {
                    break;
                }

                match c {
                    '{' => {
                        stack.push('}');
                        i += 1;
                        expect = Expect::Key;
                        may_close = true;
                        safe = Some(SafePoint {
                            end: byte_at(i),
                            closers: stack.clone(),
                        });
                    }
                    '[' => {
                        stack.push(']');
                        i += 1;
                        expect = Expect::Value;
                        may_close = true;
                        safe = Some(SafePoint {
                            end: byte_at(i),
                            closers: stack.clone(),
                        });
                    }
                    '-' | '0'..='9' | 't' | 'f' | 'n' => {
                        let start = i;
                        let numeric = c == '-' || c.is_ascii_digit();
                        while i < n {
                            let t = chars[i].1;
                            let belongs = if numeric {
                                t.is_ascii_digit() || matches!(t, '-' | '+' | '.' | 'e' | 'E')
                            } else {
                                t.is_ascii_alphabetic()
                            };
                            if !belongs {
                                break;
                            }
                            i += 1;
                        }
                        let token = &input[byte_at(start)..byte_at(i)];
                        let valid = if numeric {
                            token.parse::<serde_json::Number>().is_ok()
                        } else {
                            matches!(token, "true" | "false" | "null")
                        };
                        if !valid {
                            break;
                        }
                        complete_value(&mut expect, &stack);
                        safe = Some(SafePoint {
                            end: byte_at(i),
                            closers: stack.clone(),
                        });
                    }
                    _ => break,
                }
            }
        }
    }

    if let Some((cut, closers)) = open_value_string {
        let mut candidate = input[..cut].to_string();
        candidate.push('"');
        candidate.extend(closers.iter().rev());
        if parses(&candidate) {
            return Some(candidate);
        }
    }

    let point = safe?;
    let mut candidate = input[..point.end].to_string();
    candidate.extend(point.closers.iter().rev());
    if parses(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

fn complete_value(expect: &mut Expect, stack: &[char]) {
    *expect = if stack.is_empty() {
        Expect::End
    } else {
        Expect::CommaOrClose
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
  "overallScore": 7.5,
  "summary": "A polished look with a \"quiet luxury\" feel, café-ready.\nNice.",
  "whatsWorking": [
    {"point": "Color harmony", "detail": "Navy and rust are complementary é 😀"},
    {"point": "Fit", "detail": "Shoulders sit right."}
  ],
  "consider": [],
  "quickFixes": [{"suggestion": "Cuff the jeans", "impact": "Cleaner line"}],
  "occasionMatch": {"score": -1e2, "notes": null},
  "styleDNA": {"dominantColors": ["navy", "rust"], "formalityLevel": 3, "flags": [true, false, null]}
}"#;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```JSON {\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[1]\n```\n"), "[1]");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_repair_is_identity_on_valid_input() {
        assert_eq!(repair_truncated_json(SAMPLE).as_deref(), Some(SAMPLE));
        let compact = r#"{"a":[1,2,{"b":"c"}]}"#;
        assert_eq!(repair_truncated_json(compact).as_deref(), Some(compact));
    }

    #[test]
    fn test_repair_closes_string_and_brackets() {
        let repaired = repair_truncated_json(r#"{"summary": "Looks gre"#).unwrap();
        assert_eq!(repaired, r#"{"summary": "Looks gre"}"#);

        let repaired = repair_truncated_json(r#"{"a": [1, 2, {"b": "x"#).unwrap();
        assert_eq!(repaired, r#"{"a": [1, 2, {"b": "x"}]}"#);
    }

    #[test]
    fn test_repair_drops_dangling_escape() {
        let repaired = repair_truncated_json(r#"{"a": "quote \"#).unwrap();
        let v: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(v["a"], "quote ");

        let repaired = repair_truncated_json(r#"{"a": "caf\u00"#).unwrap();
        let v: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(v["a"], "caf");
    }

    #[test]
    fn test_repair_cuts_dangling_key_and_comma() {
        let repaired = repair_truncated_json(r#"{"a": 1, "b"#).unwrap();
        assert_eq!(repaired, r#"{"a": 1}"#);

        let repaired = repair_truncated_json(r#"{"a": 1,"#).unwrap();
        assert_eq!(repaired, r#"{"a": 1}"#);

        let repaired = repair_truncated_json(r#"{"a": [true, fa"#).unwrap();
        assert_eq!(repaired, r#"{"a": [true]}"#);
    }

    #[test]
    fn test_repair_every_truncation_point_parses() {
        for (cut, _) in SAMPLE.char_indices().skip(1) {
            let prefix = &SAMPLE[..cut];
            let repaired = repair_truncated_json(prefix)
                .unwrap_or_else(|| panic!("no repair for prefix ending at {}: {:?}", cut, prefix));
            assert!(
                serde_json::from_str::<Value>(&repaired).is_ok(),
                "unparseable repair at {}: {:?}",
                cut,
                repaired
            );
        }
    }

    #[test]
    fn test_repair_gives_up_on_garbage() {
        assert_eq!(repair_truncated_json("not json at all"), None);
        assert_eq!(repair_truncated_json(""), None);
    }

    #[test]
    fn test_degeneration_detected() {
        let segment = "abcdefghijklmnopqrstuvwxy"; // 25 chars
        let text = format!("Intro text. {}", segment.repeat(4));
        assert_eq!(detect_degeneration(&text), Some(25));

        let json_loop = format!(
            "{{\"summary\": \"{}\"}}",
            "the look is so so good and ".repeat(5)
        );
        assert!(detect_degeneration(&json_loop).is_some());
    }

    #[test]
    fn test_three_repeats_are_not_degenerate() {
        let segment = "abcdefghijklmnopqrstuvwxy";
        assert_eq!(detect_degeneration(&segment.repeat(3)), None);
    }

    #[test]
    fn test_short_segments_are_not_degenerate() {
        // 60 chars cannot hold four copies of a 20-char segment
        assert_eq!(detect_degeneration(&"ha".repeat(30)), None);
        assert!(detect_degeneration(&"ha".repeat(40)).is_some());
    }

    #[test]
    fn test_prose_is_not_degenerate() {
        let prose = "A polished, put-together look. The navy blazer anchors the outfit \
                     while the rust scarf adds warmth. Consider cuffing the jeans to show \
                     a little ankle, and swap the belt for one that matches your shoes.";
        assert_eq!(detect_degeneration(prose), None);
        assert_eq!(detect_degeneration(SAMPLE), None);
    }

    #[test]
    fn test_repetition_across_newlines_is_ignored() {
        let line = "abcdefghijklmnopqrstuvwxy\n";
        assert_eq!(detect_degeneration(&line.repeat(5)), None);
    }
}
