use url::Url;

const CREDENTIAL_KEYS: [&str; 2] = ["access_token", "refresh_token"];

/// Returns the URL fragment when it carries an inline credential.
///
/// Identity providers deliver magic-link and implicit-flow credentials as
/// `#access_token=...&refresh_token=...`. Any other fragment (anchors,
/// client-side routes) yields `None`.
#[must_use]
pub fn credential_fragment(url: &Url) -> Option<&str> {
    let fragment = url.fragment().filter(|f| !f.is_empty())?;
    let carries_credential = url::form_urlencoded::parse(fragment.as_bytes())
        .any(|(key, value)| CREDENTIAL_KEYS.contains(&key.as_ref()) && !value.is_empty());
    carries_credential.then_some(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_access_token_fragment() {
        let url: Url = "https://app.example.com/#access_token=abc&expires_in=3600&token_type=bearer"
            .parse()
            .unwrap();
        assert_eq!(
            credential_fragment(&url),
            Some("access_token=abc&expires_in=3600&token_type=bearer")
        );
    }

    #[test]
    fn detects_refresh_token_only() {
        let url: Url = "https://app.example.com/welcome#refresh_token=r1".parse().unwrap();
        assert_eq!(credential_fragment(&url), Some("refresh_token=r1"));
    }

    #[test]
    fn ignores_plain_anchor() {
        let url: Url = "https://app.example.com/faq#pricing".parse().unwrap();
        assert_eq!(credential_fragment(&url), None);
    }

    #[test]
    fn ignores_missing_and_empty_fragment() {
        let none: Url = "https://app.example.com/".parse().unwrap();
        let empty: Url = "https://app.example.com/#".parse().unwrap();
        let blank_token: Url = "https://app.example.com/#access_token=".parse().unwrap();
        assert_eq!(credential_fragment(&none), None);
        assert_eq!(credential_fragment(&empty), None);
        assert_eq!(credential_fragment(&blank_token), None);
    }
}
