//! Narrow extraction helpers for the handful of XML responses the engine
//! consumes. The documents are small and machine-generated; four tag shapes
//! do not warrant an XML parser.

/// Text of the first `<tag>...</tag>` occurrence.
pub(crate) fn first_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    xml.split(open.as_str()).nth(1)?.split(close.as_str()).next()
}

/// Text of every `<tag>...</tag>` occurrence, in document order. Also used
/// for container tags such as `<Part>` or `<Contents>`, whose inner markup
/// is then fed back through [`first_tag`].
pub(crate) fn all_tags<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    xml.split(open.as_str())
        .skip(1)
        .filter_map(|rest| rest.split(close.as_str()).next())
        .collect()
}

/// Undoes the five predefined XML entities. `&amp;` must be handled last.
pub(crate) fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "<ListPartsResult>\
        <IsTruncated>false</IsTruncated>\
        <Part><PartNumber>1</PartNumber><ETag>\"a\"</ETag></Part>\
        <Part><PartNumber>2</PartNumber><ETag>\"b\"</ETag></Part>\
        </ListPartsResult>";

    #[test]
    fn first_tag_returns_inner_text() {
        assert_eq!(first_tag(LISTING, "IsTruncated"), Some("false"));
        assert_eq!(first_tag(LISTING, "NextPartNumberMarker"), None);
    }

    #[test]
    fn all_tags_preserves_order() {
        let parts = all_tags(LISTING, "Part");
        assert_eq!(parts.len(), 2);
        assert_eq!(first_tag(parts[0], "PartNumber"), Some("1"));
        assert_eq!(first_tag(parts[1], "ETag"), Some("\"b\""));
    }

    #[test]
    fn unescape_handles_nested_entities() {
        assert_eq!(unescape("a&amp;b &lt;c&gt;"), "a&b <c>");
        assert_eq!(unescape("&amp;lt;"), "&lt;");
    }
}
