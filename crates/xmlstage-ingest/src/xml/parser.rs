//! Field extraction for recognized elements
//!
//! Pure helpers used by the reader once it has matched an element name.

use quick_xml::events::BytesStart;

/// Trim text; whitespace-only becomes `None`.
pub fn clean_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse an integer identifier, tolerating surrounding whitespace.
pub fn parse_id(raw: &str) -> Result<i64, String> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| format!("id {:?} is not an integer", raw))
}

/// Read and unescape one attribute. `Ok(None)` when it is absent.
pub fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, String> {
    match element.try_get_attribute(name) {
        Ok(Some(attr)) => attr
            .unescape_value()
            .map(|v| Some(v.into_owned()))
            .map_err(|e| format!("attribute '{}' cannot be decoded: {}", name, e)),
        Ok(None) => Ok(None),
        Err(e) => Err(format!("malformed attributes: {}", e)),
    }
}

/// The `id` attribute as an integer.
pub fn required_id(element: &BytesStart<'_>) -> Result<i64, String> {
    match attribute(element, "id")? {
        Some(raw) => parse_id(&raw),
        None => Err("missing id attribute".to_string()),
    }
}

/// Fields of a group start tag.
pub fn group_fields(element: &BytesStart<'_>) -> Result<(i64, Option<String>), String> {
    let id = required_id(element)?;
    let name = attribute(element, "name")?.and_then(|n| clean_text(&n));
    Ok((id, name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn start(tag: &str) -> BytesStart<'_> {
        BytesStart::from_content(tag, tag.find(' ').unwrap_or(tag.len()))
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  Event 1 \n"), Some("Event 1".to_string()));
        assert_eq!(clean_text(" \t\n"), None);
        assert_eq!(clean_text(""), None);
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id(" 42 "), Ok(42));
        assert_eq!(parse_id("-7"), Ok(-7));
        assert!(parse_id("4a").is_err());
        assert!(parse_id("").is_err());
        assert!(parse_id("99999999999999999999").is_err());
    }

    #[test]
    fn test_group_fields() {
        let (id, name) = group_fields(&start(r#"group_event id="3" name=" Launch &amp; Co ""#)).unwrap();
        assert_eq!(id, 3);
        assert_eq!(name.as_deref(), Some("Launch & Co"));

        let (_, name) = group_fields(&start(r#"group_event id="3" name="   ""#)).unwrap();
        assert_eq!(name, None);
    }

    #[test]
    fn test_group_fields_errors() {
        let err = group_fields(&start(r#"group_event name="x""#)).unwrap_err();
        assert_eq!(err, "missing id attribute");

        let err = group_fields(&start(r#"group_event id="x1""#)).unwrap_err();
        assert!(err.contains("not an integer"));
    }
}
