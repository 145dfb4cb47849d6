// src/enrich/text.rs
//! Plain-text helpers for generated copy: sentence counting, emphasis markup
//! checks, HTML flattening and char-safe excerpts.

use once_cell::sync::OnceCell;
use regex::Regex;

const ABBREVIATIONS: &[&str] = &[
    "U.S.", "U.K.", "E.U.", "Mr.", "Mrs.", "Ms.", "Dr.", "Inc.", "Corp.", "Ltd.", "Co.", "Jr.",
    "Sr.", "St.", "vs.", "e.g.", "i.e.", "etc.", "No.",
];

fn sentence_end_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    // terminator, optional closing quote/bracket, then whitespace or end
    RE.get_or_init(|| Regex::new(r#"[.!?]+["'\u{201D}\u{2019})\]]*(?:\s+|$)"#).expect("static regex"))
}

fn emphasis_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\*\*([^*]+?)\*\*").expect("static regex"))
}

/// Number of sentences. Decimals ("3.5%") and common abbreviations do not
/// end a sentence; trailing text without a terminator counts as one.
pub fn count_sentences(text: &str) -> usize {
    let mut masked = text.trim().to_string();
    for abbr in ABBREVIATIONS {
        masked = masked.replace(abbr, &abbr.replace('.', ""));
    }
    if masked.is_empty() {
        return 0;
    }
    let ends: Vec<_> = sentence_end_re().find_iter(&masked).collect();
    let tail_open = ends.last().map_or(true, |m| m.end() < masked.len());
    ends.len() + usize::from(tail_open)
}

/// Remove `**` markers.
pub fn strip_emphasis(text: &str) -> String {
    emphasis_re().replace_all(text, "$1").replace("**", "")
}

pub fn emphasis_spans(text: &str) -> usize {
    emphasis_re().find_iter(text).count()
}

/// True when `marked` is `original` with exactly one `**phrase**` added.
pub fn is_valid_emphasis(original: &str, marked: &str) -> bool {
    emphasis_spans(marked) == 1
        && marked.matches("**").count() == 2
        && strip_emphasis(marked) == original
}

/// Drop script/style blocks and tags, decode entities, collapse whitespace.
pub fn html_to_text(html: &str) -> String {
    static RE_BLOCKS: OnceCell<Regex> = OnceCell::new();
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();

    let re_blocks = RE_BLOCKS.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript|nav|header|footer)\b.*?</(script|style|noscript|nav|header|footer)>")
            .expect("static regex")
    });
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("static regex"));
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("static regex"));

    let out = re_blocks.replace_all(html, " ");
    let out = re_tags.replace_all(&out, " ");
    let out = html_escape::decode_html_entities(&out).to_string();
    re_ws.replace_all(&out, " ").trim().to_string()
}

/// At most `max_chars` characters, cut at a char boundary (and at a word
/// boundary when one is close).
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => {
            let head = &text[..cut];
            match head.rfind(char::is_whitespace) {
                Some(ws) if ws > cut / 2 => head[..ws].trim_end().to_string(),
                _ => head.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_sentences_ignoring_decimals_and_abbreviations() {
        assert_eq!(count_sentences("Shares rose 3.5% on Monday. Analysts expect more."), 2);
        assert_eq!(count_sentences("The U.S. market opened higher. Dr. Lee agreed!"), 2);
        assert_eq!(count_sentences("One sentence without a stop"), 1);
        assert_eq!(count_sentences("Quoted end.\" Next one?"), 2);
        assert_eq!(count_sentences("   "), 0);
    }

    #[test]
    fn emphasis_must_preserve_the_bullet() {
        let original = "Acme raised $40M. The round was led by Beta.";
        assert!(is_valid_emphasis(original, "Acme raised **$40M**. The round was led by Beta."));
        // reworded
        assert!(!is_valid_emphasis(original, "Acme raised **$40 million**. The round was led by Beta."));
        // two spans
        assert!(!is_valid_emphasis(original, "**Acme** raised **$40M**. The round was led by Beta."));
        // none
        assert!(!is_valid_emphasis(original, original));
        // dangling marker
        assert!(!is_valid_emphasis(original, "Acme raised **$40M**. The round was led by Beta.**"));
    }

    #[test]
    fn html_is_flattened() {
        let html = "<html><script>var x = 1;</script><p>Hello&nbsp;<b>world</b></p>\n<p>Again &amp; again</p></html>";
        assert_eq!(html_to_text(html), "Hello world Again & again");
    }

    #[test]
    fn excerpt_is_char_safe() {
        let s = "héllo wörld ".repeat(300);
        let e = excerpt(&s, 2000);
        assert!(e.chars().count() <= 2000);
        assert!(e.ends_with("llo") || e.ends_with("rld"));
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("日本語のテキスト", 3), "日本語");
    }
}
