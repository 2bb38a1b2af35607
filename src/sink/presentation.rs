use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};

use crate::stream::proto::{EventKind, NotificationMessage};

const IMAGE_EXTENSIONS: [&str; 6] = ["jpeg", "jpg", "gif", "png", "bmp", "webp"];

/// How a notification is surfaced to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Presentation {
    /// The message body is itself a link; open it directly.
    Link { topic: String, url: String },
    /// Render a notification page.
    Page {
        topic: String,
        title: String,
        content: String,
        attachment: Option<PageAttachment>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageAttachment {
    pub url: String,
    pub name: String,
}

impl Presentation {
    /// Picks the presentation for a notification.
    ///
    /// Only `message` events are presented. An attachment with a web url wins
    /// over a link body; anything else becomes a text page.
    pub fn classify(message: &NotificationMessage) -> Option<Self> {
        if message.event != EventKind::Message {
            return None;
        }

        let topic = message.topic.clone();
        let title = message.display_title().to_string();
        let content = message.message.clone().unwrap_or_default();

        if let Some(attachment) = message
            .attachment
            .as_ref()
            .filter(|attachment| is_web_url(&attachment.url))
        {
            return Some(Self::Page {
                topic,
                title,
                content,
                attachment: Some(PageAttachment {
                    url: attachment.url.clone(),
                    name: attachment.name.clone(),
                }),
            });
        }

        if is_web_url(&content) {
            return Some(Self::Link {
                topic,
                url: content,
            });
        }

        Some(Self::Page {
            topic,
            title,
            content,
            attachment: None,
        })
    }

    pub fn topic(&self) -> &str {
        match self {
            Self::Link { topic, .. } | Self::Page { topic, .. } => topic,
        }
    }

    /// Url to open in a tab.
    pub fn tab_url(&self) -> String {
        match self {
            Self::Link { url, .. } => url.clone(),
            Self::Page {
                title,
                content,
                attachment,
                ..
            } => page_data_url(&render_page(title, content, attachment.as_ref())),
        }
    }
}

/// `true` for `http://` and `https://` urls with something after the scheme.
pub fn is_web_url(candidate: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        candidate
            .strip_prefix(scheme)
            .is_some_and(|rest| !rest.is_empty())
    })
}

/// `true` when the url ends in a known image extension, case-insensitive.
pub fn is_image_url(url: &str) -> bool {
    let Some((_, extension)) = url.rsplit_once('.') else {
        return false;
    };
    IMAGE_EXTENSIONS
        .iter()
        .any(|known| extension.eq_ignore_ascii_case(known))
}

/// Renders the standalone notification page.
pub fn render_page(title: &str, content: &str, attachment: Option<&PageAttachment>) -> String {
    let title = escape_html(title);
    let content = escape_html(content);

    let mut extras = String::new();
    if let Some(attachment) = attachment {
        let url = escape_html(&attachment.url);
        if is_image_url(&attachment.url) {
            extras.push_str(&format!(
                r#"<img src="{url}" alt="Image" style="max-width: 100%; max-height: 100%;"><br>"#
            ));
        }
        extras.push_str(&format!(
            r#"<a class="download" href="{url}" download="attachment">Download {}</a>"#,
            escape_html(&attachment.name)
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{title}</title>
<style>
body {{ font-family: Arial, sans-serif; background-color: #2E3440; color: #D8DEE9; margin: 0; display: flex; flex-direction: column; align-items: center; text-align: center; height: 100vh; }}
.container {{ background-color: #4C566A; border-radius: 8px; padding: 30px; box-shadow: 0 4px 8px rgba(0, 0, 0, 0.2); width: 100%; box-sizing: border-box; }}
h1 {{ color: #8FBCBB; }}
.download {{ margin-top: 10px; padding: 10px 20px; background-color: #8FBCBB; color: white; text-decoration: none; border-radius: 5px; display: inline-block; }}
</style>
</head>
<body>
<div class="container">
<h1>{title}</h1>
<p>{content}</p>
{extras}
</div>
</body>
</html>"#
    )
}

/// Wraps a rendered page into a `data:` url a tab can open.
pub fn page_data_url(html: &str) -> String {
    format!("data:text/html;base64,{}", BASE64_STANDARD.encode(html))
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};

    use super::*;

    fn message(json: &str) -> NotificationMessage {
        NotificationMessage::from_text(json).expect("decode")
    }

    #[test]
    fn link_body_opens_directly() {
        let msg = message(r#"{"event":"message","topic":"t1","title":"Hi","message":"http://x/y","time":100}"#);
        assert_eq!(
            Presentation::classify(&msg),
            Some(Presentation::Link {
                topic: "t1".to_string(),
                url: "http://x/y".to_string(),
            })
        );
    }

    #[test]
    fn plain_body_becomes_text_page_titled_by_topic_when_untitled() {
        let msg = message(r#"{"event":"message","topic":"t1","message":"not a url","time":101}"#);
        let presentation = Presentation::classify(&msg).expect("presented");
        assert_eq!(
            presentation,
            Presentation::Page {
                topic: "t1".to_string(),
                title: "t1".to_string(),
                content: "not a url".to_string(),
                attachment: None,
            }
        );
        assert!(presentation.tab_url().starts_with("data:text/html;base64,"));
    }

    #[test]
    fn web_attachment_wins_over_link_body() {
        let msg = message(
            r#"{"event":"message","topic":"t","message":"https://a.b/c","time":1,
                "attachment":{"name":"cat.PNG","url":"https://files.example/cat.PNG"}}"#,
        );
        match Presentation::classify(&msg).expect("presented") {
            Presentation::Page { attachment, .. } => {
                let attachment = attachment.expect("attachment");
                assert_eq!(attachment.name, "cat.PNG");
            }
            other => panic!("unexpected presentation: {other:?}"),
        }
    }

    #[test]
    fn non_web_attachment_is_ignored() {
        let msg = message(
            r#"{"event":"message","topic":"t","message":"hello","time":1,
                "attachment":{"name":"x","url":"ftp://files.example/x"}}"#,
        );
        assert!(matches!(
            Presentation::classify(&msg),
            Some(Presentation::Page { attachment: None, .. })
        ));
    }

    #[test]
    fn non_message_events_are_not_presented() {
        let msg = message(r#"{"event":"keepalive","topic":"t","time":1}"#);
        assert!(Presentation::classify(&msg).is_none());
    }

    #[test]
    fn url_and_image_detection() {
        assert!(is_web_url("https://ntfy.sh/x"));
        assert!(!is_web_url("https://"));
        assert!(!is_web_url("see https://ntfy.sh"));
        assert!(is_image_url("https://x/y.JPEG"));
        assert!(is_image_url("https://x/y.webp"));
        assert!(!is_image_url("https://x/y.pdf"));
        assert!(!is_image_url("noextension"));
    }

    #[test]
    fn rendered_page_escapes_content_and_embeds_images() {
        let attachment = PageAttachment {
            url: "https://files.example/cat.png".to_string(),
            name: "cat <1>".to_string(),
        };
        let html = render_page("<b>Hi</b>", "a & b", Some(&attachment));

        assert!(html.contains("<title>&lt;b&gt;Hi&lt;/b&gt;</title>"));
        assert!(html.contains("<p>a &amp; b</p>"));
        assert!(html.contains(r#"<img src="https://files.example/cat.png""#));
        assert!(html.contains("Download cat &lt;1&gt;"));
    }

    #[test]
    fn data_url_round_trips_page() {
        let html = render_page("T", "C", None);
        let url = page_data_url(&html);
        let encoded = url.strip_prefix("data:text/html;base64,").expect("prefix");
        let decoded = BASE64_STANDARD.decode(encoded).expect("base64");
        assert_eq!(String::from_utf8(decoded).expect("utf8"), html);
        assert!(!html.contains("<img"));
    }
}
