// src/compile.rs
//! Render an issue's finished stories into the artifact handed to delivery.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use html_escape::{encode_double_quoted_attribute, encode_text};
use serde::{Deserialize, Serialize};

use crate::enrich::text::strip_emphasis;
use crate::error::{PipelineError, Result};
use crate::model::{DecoratedStory, ImageStatus, StoryStatus};

/// A compiled issue, ready to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub issue_id: String,
    pub date: NaiveDate,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub stories: usize,
}

/// `**phrase**` to `<strong>`, everything else escaped.
fn bullet_html(bullet: &str) -> String {
    let mut out = String::new();
    for (i, part) in bullet.split("**").enumerate() {
        if i % 2 == 1 {
            out.push_str("<strong>");
            out.push_str(&encode_text(part));
            out.push_str("</strong>");
        } else {
            out.push_str(&encode_text(part));
        }
    }
    out
}

/// Text-complete stories in slot order. Stories that failed or never got
/// past structuring are left out.
pub fn publishable(stories: &[DecoratedStory]) -> Vec<&DecoratedStory> {
    let mut out: Vec<&DecoratedStory> = stories
        .iter()
        .filter(|s| s.status == StoryStatus::TextComplete && s.is_structured())
        .collect();
    out.sort_by_key(|s| s.slot);
    out
}

pub fn compile(issue_id: &str, date: NaiveDate, title: &str, stories: &[DecoratedStory]) -> Result<Artifact> {
    let ready = publishable(stories);
    let Some(lead) = ready.first() else {
        return Err(PipelineError::InvalidInput(format!(
            "issue {issue_id} has no publishable stories"
        )));
    };
    let subject = format!(
        "{title} {}: {}",
        date.format("%Y-%m-%d"),
        lead.headline.as_deref().unwrap_or_default()
    );

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
    html.push_str("  <meta charset=\"UTF-8\">\n");
    html.push_str(&format!("  <title>{}</title>\n", encode_text(&subject)));
    html.push_str("  <style>\n");
    html.push_str("    body { font-family: Georgia, serif; max-width: 680px; margin: 32px auto; padding: 0 16px; line-height: 1.55; color: #1f2933; }\n");
    html.push_str("    h1 { border-bottom: 3px solid #1f2933; padding-bottom: 8px; }\n");
    html.push_str("    .label { text-transform: uppercase; letter-spacing: 0.08em; font-size: 0.75em; color: #52606d; }\n");
    html.push_str("    .dek { font-style: italic; color: #3e4c59; }\n");
    html.push_str("    .source { font-size: 0.85em; }\n");
    html.push_str("    img { max-width: 100%; border-radius: 4px; }\n");
    html.push_str("    hr { border: none; border-top: 1px solid #cbd2d9; margin: 28px 0; }\n");
    html.push_str("  </style>\n");
    html.push_str("</head>\n<body>\n");
    html.push_str(&format!(
        "<h1>{} &middot; {}</h1>\n",
        encode_text(title),
        date.format("%A, %B %-d, %Y")
    ));

    let mut text = format!("{title} - {}\n\n", date.format("%Y-%m-%d"));

    for story in &ready {
        let headline = story.headline.as_deref().unwrap_or_default();
        let label = story.label.as_deref().unwrap_or_default();
        html.push_str(&format!("<section class=\"story\" id=\"slot-{}\">\n", story.slot));
        html.push_str(&format!("  <div class=\"label\">{}</div>\n", encode_text(label)));
        html.push_str(&format!("  <h2>{}</h2>\n", encode_text(headline)));
        if story.image_status == ImageStatus::Generated {
            if let Some(src) = &story.image_url {
                html.push_str(&format!(
                    "  <img src=\"{}\" alt=\"{}\">\n",
                    encode_double_quoted_attribute(src),
                    encode_double_quoted_attribute(headline)
                ));
            }
        }
        if let Some(dek) = &story.dek {
            html.push_str(&format!("  <p class=\"dek\">{}</p>\n", encode_text(dek)));
        }
        html.push_str("  <ul>\n");
        for b in &story.bullets {
            html.push_str(&format!("    <li>{}</li>\n", bullet_html(b)));
        }
        html.push_str("  </ul>\n");
        if let Some(url) = &story.source_url {
            html.push_str(&format!(
                "  <p class=\"source\"><a href=\"{}\">Read the source</a></p>\n",
                encode_double_quoted_attribute(url)
            ));
        }
        html.push_str("</section>\n<hr>\n");

        text.push_str(&format!("[{}] {headline}\n", label.to_uppercase()));
        if let Some(dek) = &story.dek {
            text.push_str(dek);
            text.push('\n');
        }
        for b in &story.bullets {
            text.push_str(&format!("  - {}\n", strip_emphasis(b)));
        }
        if let Some(url) = &story.source_url {
            text.push_str(&format!("  {url}\n"));
        }
        text.push('\n');
    }
    html.push_str("</body>\n</html>");

    Ok(Artifact {
        issue_id: issue_id.to_string(),
        date,
        subject,
        html,
        text,
        stories: ready.len(),
    })
}

/// Write `<dir>/<issue_id>.html` and `<issue_id>.json`. Returns the HTML path.
pub async fn save(dir: &Path, artifact: &Artifact) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| PipelineError::Fatal(format!("creating {}: {e}", dir.display())))?;
    let html_path = dir.join(format!("{}.html", artifact.issue_id));
    tokio::fs::write(&html_path, &artifact.html)
        .await
        .map_err(|e| PipelineError::Fatal(format!("writing {}: {e}", html_path.display())))?;
    let json_path = dir.join(format!("{}.json", artifact.issue_id));
    let body = serde_json::to_vec_pretty(artifact)?;
    tokio::fs::write(&json_path, body)
        .await
        .map_err(|e| PipelineError::Fatal(format!("writing {}: {e}", json_path.display())))?;
    Ok(html_path)
}

/// Read back an artifact written by [`save`].
pub async fn load(dir: &Path, issue_id: &str) -> Result<Artifact> {
    let path = dir.join(format!("{issue_id}.json"));
    let body = tokio::fs::read(&path)
        .await
        .map_err(|e| PipelineError::NotFound(format!("{}: {e}", path.display())))?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(slot: u8, status: StoryStatus) -> DecoratedStory {
        DecoratedStory {
            issue_id: "2026-10-17".into(),
            slot,
            fingerprint: format!("p_{slot}"),
            source_url: Some(format!("https://news.test/{slot}?a=1&b=2")),
            headline: Some(format!("Story <{slot}>")),
            dek: Some("A dek.".into()),
            bullets: vec!["One **big** thing. Two.".into(), "Three. Four.".into(), "Five. Six.".into()],
            label: Some("World".into()),
            status,
            ..DecoratedStory::default()
        }
    }

    #[test]
    fn only_text_complete_stories_in_slot_order() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let stories = vec![
            story(3, StoryStatus::TextComplete),
            story(1, StoryStatus::TextComplete),
            story(2, StoryStatus::Failed),
        ];
        let a = compile("2026-10-17", date, "Daily", &stories).unwrap();
        assert_eq!(a.stories, 2);
        assert!(a.subject.ends_with("Story <1>"));
        assert!(a.html.find("slot-1").unwrap() < a.html.find("slot-3").unwrap());
        assert!(!a.html.contains("slot-2"));
        assert!(a.html.contains("Story &lt;1&gt;"));
        assert!(a.html.contains("<strong>big</strong>"));
        assert!(a.html.contains("?a=1&amp;b=2"));
        assert!(a.text.contains("  - One big thing. Two."));
    }

    #[test]
    fn nothing_publishable_is_an_error() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        assert!(compile("x", date, "Daily", &[story(1, StoryStatus::Failed)]).is_err());
    }

    #[tokio::test]
    async fn saved_artifact_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let a = compile("2026-10-17", date, "Daily", &[story(1, StoryStatus::TextComplete)]).unwrap();
        let path = save(dir.path(), &a).await.unwrap();
        assert!(path.ends_with("2026-10-17.html"));
        assert_eq!(load(dir.path(), "2026-10-17").await.unwrap(), a);
    }
}
