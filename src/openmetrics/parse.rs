//! Prometheus text-format parsing, restricted to the family types the
//! monitor consumes.

use std::collections::{BTreeMap, HashMap};

/// Family types the monitor samples. Histogram, summary and untyped families
/// are dropped at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FamilyType {
    Gauge,
    Counter,
}

/// One parsed sample from a gauge or counter family.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Parse a Prometheus text-format exposition, keeping gauge and counter
/// samples only. Malformed lines are skipped.
pub fn parse_text(body: &str) -> Vec<Sample> {
    let mut types: HashMap<String, FamilyType> = HashMap::new();
    let mut samples = Vec::new();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("# TYPE ") {
            let mut parts = rest.split_whitespace();
            if let (Some(name), Some(kind)) = (parts.next(), parts.next()) {
                let kind = match kind {
                    "gauge" => Some(FamilyType::Gauge),
                    "counter" => Some(FamilyType::Counter),
                    _ => None,
                };
                if let Some(kind) = kind {
                    types.insert(name.to_string(), kind);
                }
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        if let Some(sample) = parse_sample_line(line, &types) {
            samples.push(sample);
        }
    }

    samples
}

/// Parse one `name{labels} value [timestamp]` line against the known family
/// types. Returns None for untyped families and malformed lines.
fn parse_sample_line(line: &str, types: &HashMap<String, FamilyType>) -> Option<Sample> {
    let (name, rest) = match line.find(|c: char| c == '{' || c.is_whitespace()) {
        Some(idx) => (&line[..idx], &line[idx..]),
        None => return None, // no value
    };

    if !family_is_sampled(name, types) {
        return None;
    }

    let (labels, value_part) = if let Some(rest) = rest.strip_prefix('{') {
        let close = find_label_block_end(rest)?;
        (parse_labels(&rest[..close]), &rest[close + 1..])
    } else {
        (BTreeMap::new(), rest)
    };

    // First field after the label block is the value; an optional timestamp
    // may follow and is ignored (records carry their own timestamps).
    let value_str = value_part.split_whitespace().next()?;
    let value = parse_value(value_str)?;

    Some(Sample {
        name: name.to_string(),
        labels,
        value,
    })
}

/// A sample belongs to a sampled family when its name matches a gauge or
/// counter TYPE declaration, directly or via the counter `_total` suffix.
fn family_is_sampled(name: &str, types: &HashMap<String, FamilyType>) -> bool {
    if types.contains_key(name) {
        return true;
    }
    match name.strip_suffix("_total") {
        Some(base) => types.get(base) == Some(&FamilyType::Counter),
        None => false,
    }
}

/// Find the index of the closing `}` of a label block, honoring quoted
/// values and backslash escapes.
fn find_label_block_end(s: &str) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '}' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

/// Parse the inside of a label block: `k="v",k2="v2"`.
fn parse_labels(block: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut chars = block.char_indices().peekable();

    while let Some(&(start, _)) = chars.peek() {
        // Label name runs up to '='.
        let eq = match block[start..].find('=') {
            Some(off) => start + off,
            None => break,
        };
        let name = block[start..eq].trim_matches(',').trim().to_string();

        // Value must be quoted.
        let rest = &block[eq + 1..];
        if !rest.starts_with('"') {
            break;
        }
        let mut value = String::new();
        let mut consumed = 1; // opening quote
        let mut escaped = false;
        let mut closed = false;
        for c in rest[1..].chars() {
            consumed += c.len_utf8();
            if escaped {
                match c {
                    'n' => value.push('\n'),
                    other => value.push(other),
                }
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                closed = true;
                break;
            } else {
                value.push(c);
            }
        }
        if !closed {
            break;
        }
        if !name.is_empty() {
            labels.insert(name, value);
        }

        // Advance the iterator past what we consumed.
        let next_pos = eq + 1 + consumed;
        while chars.peek().is_some_and(|&(i, _)| i < next_pos) {
            let _ = chars.next();
        }
    }

    labels
}

/// Parse a sample value, accepting the Prometheus spellings of infinities.
fn parse_value(s: &str) -> Option<f64> {
    match s {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_samples_are_kept() {
        let body = "\
# HELP m a metric
# TYPE m gauge
m{pod=\"a\"} 1.0
m{pod=\"b\"} 2.0
";
        let samples = parse_text(body);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].labels["pod"], "a");
        assert_eq!(samples[0].value, 1.0);
        assert_eq!(samples[1].value, 2.0);
    }

    #[test]
    fn counter_total_suffix_matches_family() {
        let body = "\
# TYPE requests counter
requests_total{code=\"200\"} 17
";
        let samples = parse_text(body);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "requests_total");
        assert_eq!(samples[0].value, 17.0);
    }

    #[test]
    fn histogram_summary_untyped_are_dropped() {
        let body = "\
# TYPE lat histogram
lat_bucket{le=\"0.1\"} 3
lat_sum 12.0
# TYPE q summary
q{quantile=\"0.5\"} 1.0
untyped_metric 5.0
";
        assert!(parse_text(body).is_empty());
    }

    #[test]
    fn bare_metric_without_labels() {
        let body = "# TYPE up gauge\nup 1\n";
        let samples = parse_text(body);
        assert_eq!(samples.len(), 1);
        assert!(samples[0].labels.is_empty());
    }

    #[test]
    fn trailing_timestamp_is_ignored() {
        let body = "# TYPE m gauge\nm{a=\"x\"} 3.5 1700000000000\n";
        let samples = parse_text(body);
        assert_eq!(samples[0].value, 3.5);
    }

    #[test]
    fn escaped_quotes_and_braces_in_label_values() {
        let body = "# TYPE m gauge\nm{msg=\"say \\\"hi\\\"\",path=\"a}b\"} 1\n";
        let samples = parse_text(body);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels["msg"], "say \"hi\"");
        assert_eq!(samples[0].labels["path"], "a}b");
    }

    #[test]
    fn infinity_spellings_parse() {
        let body = "# TYPE m gauge\nm 0\nm +Inf\nm -Inf\n";
        let samples = parse_text(body);
        assert_eq!(samples.len(), 3);
        assert!(samples[1].value.is_infinite());
        assert!(samples[2].value.is_sign_negative());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let body = "\
# TYPE m gauge
m{unclosed=\"v 1.0
m{} not-a-number
m 2.0
";
        let samples = parse_text(body);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 2.0);
    }
}
