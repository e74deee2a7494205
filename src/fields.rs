use std::collections::HashSet;
use std::fmt::Display;

/// Errors raised while expanding field label strings at template or
/// evaluation load time. These are fatal to loading the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldParseError {
    InvalidRange(String),
    OverlappingFields { context: String, field_string: String },
}

impl Display for FieldParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldParseError::InvalidRange(s) => {
                write!(f, "invalid range in field string '{}'", s)
            }
            FieldParseError::OverlappingFields {
                context,
                field_string,
            } => write!(
                f,
                "field string '{}' has overlapping field(s) with other fields in '{}'",
                field_string, context
            ),
        }
    }
}

/// Expands a list of field strings into individual labels, rejecting any
/// overlap between the expansions.
pub fn parse_fields(context: &str, field_strings: &[String]) -> Result<Vec<String>, FieldParseError> {
    let mut parsed = Vec::new();
    let mut seen = HashSet::new();

    for field_string in field_strings {
        let labels = parse_field_string(field_string)?;
        for label in &labels {
            if !seen.insert(label.clone()) {
                return Err(FieldParseError::OverlappingFields {
                    context: context.to_string(),
                    field_string: field_string.clone(),
                });
            }
        }
        parsed.extend(labels);
    }

    Ok(parsed)
}

/// Expands a single field string. Supports plain labels (`roll`) and
/// inclusive numeric ranges with two or three dots (`q1..4`, `q1...4`).
pub fn parse_field_string(field_string: &str) -> Result<Vec<String>, FieldParseError> {
    let Some(range) = split_range(field_string) else {
        return Ok(vec![field_string.to_string()]);
    };

    let (prefix, start_str, end_str) = range;
    let (Ok(start), Ok(end)) = (start_str.parse::<u32>(), end_str.parse::<u32>()) else {
        return Ok(vec![field_string.to_string()]);
    };

    if start >= end {
        return Err(FieldParseError::InvalidRange(field_string.to_string()));
    }

    Ok((start..=end).map(|i| format!("{}{}", prefix, i)).collect())
}

/// Splits `prefix<digits>..<digits>` (two or three dots) into its pieces.
/// Returns `None` for anything that doesn't match that shape.
fn split_range(field_string: &str) -> Option<(&str, &str, &str)> {
    let dots = field_string.find("..")?;
    let (head, tail) = field_string.split_at(dots);
    let tail = tail.strip_prefix("...").or_else(|| tail.strip_prefix(".."))?;

    let digits_at = head.find(|c: char| c.is_ascii_digit())?;
    let (prefix, start) = head.split_at(digits_at);
    if prefix.is_empty()
        || !start.chars().all(|c| c.is_ascii_digit())
        || tail.is_empty()
        || !tail.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    Some((prefix, start, tail))
}

/// Sort key for output columns: alphabetical prefix, then numeric suffix,
/// so `q2` sorts before `q10`.
pub fn output_column_sort_key(label: &str) -> (String, u32) {
    let digits_at = label
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(label.len());
    let (prefix, suffix) = label.split_at(digits_at);
    let num = suffix.parse::<u32>().unwrap_or(0);
    (prefix.to_string(), num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_label_passes_through() {
        assert_eq!(parse_field_string("roll").unwrap(), vec!["roll"]);
    }

    #[test]
    fn two_dot_range_expands_inclusively() {
        assert_eq!(
            parse_field_string("q1..4").unwrap(),
            vec!["q1", "q2", "q3", "q4"]
        );
    }

    #[test]
    fn three_dot_range_expands_inclusively() {
        assert_eq!(parse_field_string("q9...11").unwrap(), vec!["q9", "q10", "q11"]);
    }

    #[test]
    fn inverted_range_is_an_error() {
        assert!(matches!(
            parse_field_string("q5..2"),
            Err(FieldParseError::InvalidRange(_))
        ));
    }

    #[test]
    fn overlapping_expansions_are_rejected() {
        let fields = vec!["q1..4".to_string(), "q3..6".to_string()];
        assert!(matches!(
            parse_fields("Block A", &fields),
            Err(FieldParseError::OverlappingFields { .. })
        ));
    }

    #[test]
    fn disjoint_expansions_concatenate_in_order() {
        let fields = vec!["q1..2".to_string(), "roll".to_string()];
        assert_eq!(
            parse_fields("Block A", &fields).unwrap(),
            vec!["q1", "q2", "roll"]
        );
    }

    #[test]
    fn sort_key_orders_numeric_suffixes_naturally() {
        let mut labels = vec!["q10", "q2", "roll", "q1"];
        labels.sort_by_key(|l| output_column_sort_key(l));
        assert_eq!(labels, vec!["q1", "q2", "q10", "roll"]);
    }
}
