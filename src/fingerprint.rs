// src/fingerprint.rs
//! Deterministic dedup keys for fetched items.
//!
//! The identity is the normalized URL when one is present, otherwise the
//! normalized title. The key is a 32-bit multiplicative (djb2 style) hash of
//! that identity in base-36, prefixed with `p_`. Collisions are possible in a
//! 32-bit space and accepted.

use url::Url;

use crate::error::{PipelineError, Result};

const HASH_SEED: u32 = 5381;
const PREFIX: &str = "p_";

/// Query parameters that only carry campaign/click tracking.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid",
    "gclid",
    "dclid",
    "msclkid",
    "yclid",
    "mc_cid",
    "mc_eid",
    "igshid",
    "ref",
    "ref_src",
    "cmpid",
    "_hsenc",
    "_hsmi",
    "mkt_tok",
    "oly_enc_id",
    "oly_anon_id",
    "s_cid",
    "sr_share",
];

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name)
}

/// Compute the dedup key for an item. Fails when both inputs are blank.
pub fn fingerprint(url: Option<&str>, title: Option<&str>) -> Result<String> {
    let identity = normalize_identity(url, title)?;
    Ok(format!("{PREFIX}{}", to_base36(rolling_hash(&identity))))
}

/// The string that actually gets hashed.
pub fn normalize_identity(url: Option<&str>, title: Option<&str>) -> Result<String> {
    let url = url.map(str::trim).filter(|u| !u.is_empty());
    if let Some(u) = url {
        return Ok(normalize_url(u));
    }
    let title = title.map(str::trim).filter(|t| !t.is_empty());
    match title {
        Some(t) => Ok(t.to_lowercase()),
        None => Err(PipelineError::InvalidInput(
            "fingerprint needs a url or a title".into(),
        )),
    }
}

/// Lowercase, drop fragment and tracking params, strip trailing slashes.
pub fn normalize_url(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let out = match Url::parse(&lowered) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let path = parsed.path().trim_end_matches('/').to_string();
            parsed.set_path(&path);
            let kept: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(k, _)| !is_tracking_param(k))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if kept.is_empty() {
                parsed.set_query(None);
            } else {
                parsed.query_pairs_mut().clear().extend_pairs(kept);
            }
            parsed.to_string()
        }
        Err(_) => normalize_url_text(&lowered),
    };
    out.trim_end_matches('/').to_string()
}

/// Same rules for strings the URL parser rejects (scheme-less links etc).
fn normalize_url_text(lowered: &str) -> String {
    let no_fragment = lowered.split('#').next().unwrap_or_default();
    let (base, query) = match no_fragment.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (no_fragment, None),
    };
    let base = base.trim_end_matches('/');
    let kept: Vec<&str> = query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .filter(|pair| {
                    let name = pair.split('=').next().unwrap_or_default();
                    !is_tracking_param(name)
                })
                .collect()
        })
        .unwrap_or_default();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}

/// `acc = acc * 33 + unit`, wrapping at 32 bits, over UTF-16 code units.
fn rolling_hash(s: &str) -> u32 {
    s.encode_utf16().fold(HASH_SEED, |acc, unit| {
        acc.wrapping_mul(33).wrapping_add(u32::from(unit))
    })
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::with_capacity(7);
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_reference_values() {
        // djb2-multiplicative over "a": 5381 * 33 + 97
        assert_eq!(rolling_hash("a"), 177_670);
        assert_eq!(to_base36(177_670), "3t3a");
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn same_input_same_key() {
        let a = fingerprint(Some("https://example.com/story"), None).unwrap();
        let b = fingerprint(Some("https://example.com/story"), None).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("p_"));
    }

    #[test]
    fn tracking_params_case_fragment_and_slash_are_ignored() {
        let base = fingerprint(Some("https://example.com/a/b?id=7"), None).unwrap();
        for variant in [
            "https://EXAMPLE.com/a/b?id=7&utm_source=newsletter&utm_medium=email",
            "https://example.com/a/b/?id=7#section-2",
            "https://example.com/a/b?fbclid=xyz&id=7",
            "  https://example.com/a/b?id=7&gclid=abc  ",
        ] {
            assert_eq!(fingerprint(Some(variant), None).unwrap(), base, "{variant}");
        }
    }

    #[test]
    fn meaningful_query_params_change_the_key() {
        let a = fingerprint(Some("https://example.com/a?id=1"), None).unwrap();
        let b = fingerprint(Some("https://example.com/a?id=2"), None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn url_wins_over_title_and_title_is_fallback() {
        let with_url = fingerprint(Some("https://x.test/p"), Some("Title")).unwrap();
        let url_only = fingerprint(Some("https://x.test/p"), None).unwrap();
        assert_eq!(with_url, url_only);

        let t1 = fingerprint(None, Some("  Big News Today ")).unwrap();
        let t2 = fingerprint(Some("   "), Some("big news today")).unwrap();
        assert_eq!(t1, t2);
    }

    #[test]
    fn empty_identity_is_invalid_input() {
        let err = fingerprint(Some(""), Some("   ")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
        assert!(fingerprint(None, None).is_err());
    }

    #[test]
    fn unparseable_urls_follow_the_same_rules() {
        assert_eq!(
            normalize_url("Example.com/Path/?utm_campaign=x&q=1#top"),
            "example.com/path?q=1"
        );
        assert_eq!(normalize_url("example.com/path/"), "example.com/path");
    }
}
