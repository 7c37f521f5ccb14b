//! Small helpers for `Accept` / `Content-Type` header values.

/// Picks a concrete media type out of an `Accept`-style header value.
///
/// The value is split on `,` and `;`, so quality parameters and charset
/// annotations fall away as separate tokens. Tokens without a `/` are
/// ignored. The first fully-specified `type/subtype` wins; if none exists,
/// the first partial wildcard (`type/*`) is used, then `*/*`. When
/// `no_wildcard` is set, a wildcard result is replaced by `fallback`.
/// An empty or absent header also yields `fallback`.
pub fn accepted_mime_type(header: Option<&str>, fallback: &str, no_wildcard: bool) -> String {
    let raw = match header {
        Some(raw) => raw,
        None => return fallback.to_string(),
    };

    let mut partial_wildcard: Option<&str> = None;
    let mut full_wildcard = false;

    for token in raw.split([',', ';']) {
        let token = token.trim();
        if !token.contains('/') {
            continue;
        }
        if !token.contains('*') {
            return token.to_string();
        }
        if token == "*/*" {
            full_wildcard = true;
        } else if partial_wildcard.is_none() {
            partial_wildcard = Some(token);
        }
    }

    if let Some(partial) = partial_wildcard {
        if no_wildcard {
            return fallback.to_string();
        }
        return partial.to_string();
    }

    if full_wildcard && !no_wildcard {
        return "*/*".to_string();
    }

    fallback.to_string()
}

/// Returns true for media types whose payload is textual: anything under
/// `text/`, plus XML-shaped types (`*/xml`, `*/xhtml+xml`).
pub fn is_text_mime(mime: &str) -> bool {
    if mime.is_empty() {
        return false;
    }
    mime.starts_with("text/") || mime.ends_with("/xhtml+xml") || mime.ends_with("/xml")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefers_first_fully_specified_type() {
        assert_eq!(
            accepted_mime_type(Some("text/html, */*"), "application/octet-stream", false),
            "text/html"
        );
        assert_eq!(
            accepted_mime_type(Some("*/*, image/png"), "text/html", false),
            "image/png"
        );
    }

    #[test]
    fn strips_parameters() {
        assert_eq!(
            accepted_mime_type(Some("text/html; charset=utf-8"), "text/plain", false),
            "text/html"
        );
        assert_eq!(
            accepted_mime_type(Some("text/html;q=0.9,image/webp"), "text/plain", false),
            "text/html"
        );
    }

    #[test]
    fn falls_back_through_wildcards() {
        assert_eq!(accepted_mime_type(Some("image/*"), "text/html", false), "image/*");
        assert_eq!(accepted_mime_type(Some("*/*"), "text/html", false), "*/*");
        assert_eq!(accepted_mime_type(Some("image/*, */*"), "text/html", false), "image/*");
    }

    #[test]
    fn no_wildcard_replaces_wildcards_with_fallback() {
        assert_eq!(accepted_mime_type(Some("*/*"), "text/html", true), "text/html");
        assert_eq!(accepted_mime_type(Some("image/*"), "text/html", true), "text/html");
        assert_eq!(
            accepted_mime_type(Some("image/png, */*"), "text/html", true),
            "image/png"
        );
    }

    #[test]
    fn empty_input_yields_fallback() {
        assert_eq!(accepted_mime_type(None, "text/html", false), "text/html");
        assert_eq!(accepted_mime_type(Some(""), "text/html", false), "text/html");
        assert_eq!(accepted_mime_type(Some("q=0.9"), "text/html", false), "text/html");
    }

    #[test]
    fn idempotent_on_own_output() {
        for input in ["text/html, */*", "image/*", "*/*", ""] {
            let once = accepted_mime_type(Some(input), "text/html", false);
            let twice = accepted_mime_type(Some(&once), "text/html", false);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn text_classification() {
        assert!(is_text_mime("text/html"));
        assert!(is_text_mime("text/plain"));
        assert!(is_text_mime("application/xml"));
        assert!(is_text_mime("application/xhtml+xml"));
        assert!(!is_text_mime("image/png"));
        assert!(!is_text_mime("application/octet-stream"));
        assert!(!is_text_mime(""));
    }

    #[test]
    fn accept_header_text_detection_end_to_end() {
        assert!(is_text_mime(&accepted_mime_type(Some("text/html, */*"), "", false)));
        assert!(!is_text_mime(&accepted_mime_type(Some("image/png"), "", false)));
    }
}
