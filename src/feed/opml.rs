//! OPML subscription lists.
//!
//! Import walks every `<outline>` element, at any nesting depth, and keeps the
//! ones that carry an `xmlUrl`. Export writes a flat OPML 2.0 body with one
//! `type="rss"` outline per subscription, in list order.

use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::util::validate_feed_url;

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

/// Text of the `<head><title>` element in exported documents.
const EXPORT_TITLE: &str = "kiosk subscriptions";

#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// The document is not well-formed XML, or uses an undeclared entity.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Reading the source file or writing the exported one failed.
    #[error("OPML file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generated OPML is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl From<quick_xml::Error> for OpmlError {
    fn from(e: quick_xml::Error) -> Self {
        OpmlError::XmlParse(e.to_string())
    }
}

/// A subscription read from, or written to, an OPML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// Display name: the `title` attribute, else `text`, else the url.
    pub title: String,
    /// The `xmlUrl` attribute.
    pub xml_url: String,
}

// ============================================================================
// Import
// ============================================================================

/// Reads the OPML file at `path` and returns its subscriptions in document
/// order.
///
/// See [`parse_opml_content`] for what counts as a subscription.
///
/// # Errors
///
/// [`OpmlError::Io`] if the file cannot be read or is not UTF-8, plus every
/// error [`parse_opml_content`] returns.
pub async fn parse(path: &Path) -> Result<Vec<OpmlFeed>, OpmlError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_opml_content(&content)
}

/// Parses OPML text into subscriptions, in document order.
///
/// Every `<outline>` with an `xmlUrl` attribute is a subscription, whether
/// it sits directly in `<body>` or inside folder outlines. Folders themselves
/// (outlines without `xmlUrl`) are walked but not returned. Outlines whose
/// `xmlUrl` is not a well-formed http(s) address are skipped with a warning
/// rather than failing the whole import.
///
/// # Errors
///
/// - [`OpmlError::MaxDepthExceeded`] when outlines nest deeper than 50 levels.
/// - [`OpmlError::XmlParse`] for malformed XML, malformed attributes on an
///   outline, or references to entities other than the five predefined ones.
pub fn parse_opml_content(content: &str) -> Result<Vec<OpmlFeed>, OpmlError> {
    // SEC-002: quick-xml (0.37) resolves only the five predefined entities;
    // custom <!ENTITY> declarations surface as errors from
    // decode_and_unescape_value() instead of being expanded.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    let mut open_outlines: usize = 0;

    loop {
        let (element, nests) = match reader.read_event()? {
            Event::Start(e) => (e, true),
            Event::Empty(e) => (e, false),
            Event::End(e) => {
                if e.name().as_ref() == b"outline" {
                    open_outlines = open_outlines.saturating_sub(1);
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };
        if element.name().as_ref() != b"outline" {
            continue;
        }
        if nests {
            open_outlines += 1;
            if open_outlines > MAX_OPML_DEPTH {
                return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
            }
        }
        feeds.extend(subscription(&element, &reader)?);
    }

    Ok(feeds)
}

/// Reads one attribute, unescaped; `None` when absent.
fn attribute(
    element: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
    name: &str,
) -> Result<Option<String>, OpmlError> {
    let Some(attr) = element
        .try_get_attribute(name)
        .map_err(|e| OpmlError::XmlParse(e.to_string()))?
    else {
        return Ok(None);
    };
    Ok(Some(attr.decode_and_unescape_value(reader.decoder())?.into_owned()))
}

fn subscription(
    element: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<OpmlFeed>, OpmlError> {
    let Some(xml_url) = attribute(element, reader, "xmlUrl")? else {
        return Ok(None);
    };
    if let Err(e) = validate_feed_url(&xml_url, false) {
        tracing::warn!(url = %xml_url, error = %e, "Skipping invalid feed URL in OPML");
        return Ok(None);
    }

    let title = [
        attribute(element, reader, "title")?,
        attribute(element, reader, "text")?,
    ]
    .into_iter()
    .flatten()
    .find(|t| !t.trim().is_empty())
    .unwrap_or_else(|| xml_url.clone());

    Ok(Some(OpmlFeed { title, xml_url }))
}

// ============================================================================
// Export
// ============================================================================

/// Renders subscriptions as an OPML 2.0 document.
///
/// Each feed becomes an empty `<outline type="rss">` element with its name in
/// both `text` and `title`. Attribute values are XML-escaped, so the output
/// parses back through [`parse_opml_content`] to the same list.
pub fn export_opml(feeds: &[OpmlFeed]) -> Result<String, OpmlError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    writer
        .create_element("opml")
        .with_attribute(("version", "2.0"))
        .write_inner_content(|w| {
            w.create_element("head").write_inner_content(|w| {
                w.create_element("title")
                    .write_text_content(BytesText::new(EXPORT_TITLE))?;
                Ok(())
            })?;
            w.create_element("body").write_inner_content(|w| {
                for feed in feeds {
                    w.create_element("outline")
                        .with_attributes([
                            ("type", "rss"),
                            ("text", feed.title.as_str()),
                            ("title", feed.title.as_str()),
                            ("xmlUrl", feed.xml_url.as_str()),
                        ])
                        .write_empty()?;
                }
                Ok(())
            })?;
            Ok(())
        })?;

    Ok(String::from_utf8(writer.into_inner())?)
}

/// Writes subscriptions to `path` as OPML, replacing any existing file.
///
/// The document is written to a temporary sibling of `path`, synced to disk
/// and renamed into place, so readers see either the old file or the complete
/// new one. On failure the temporary file is removed and `path` is untouched.
///
/// # Errors
///
/// [`OpmlError::Io`] if the directory is missing or not writable, or if the
/// write, sync or rename fails.
pub fn export_to_file(feeds: &[OpmlFeed], path: &Path) -> Result<(), OpmlError> {
    let content = export_opml(feeds)?;
    let temp_path = temp_sibling(path);

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)?;

    if let Err(e) = write_synced(file, content.as_bytes())
        .and_then(|()| std::fs::rename(&temp_path, path))
    {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    tracing::debug!(path = %path.display(), feeds = feeds.len(), "Exported OPML");
    Ok(())
}

/// SEC-009: Randomized temp filename so a pre-planted path cannot be raced.
fn temp_sibling(path: &Path) -> PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    path.with_extension(format!("tmp.{:016x}", nanos))
}

/// Writes, syncs and closes `file`.
fn write_synced(mut file: File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_nested_outlines() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Test Feeds</title></head>
  <body>
    <outline text="Blogs" title="Blogs">
      <outline type="rss" text="Example Blog" title="Example Blog" xmlUrl="https://example.com/feed.xml"/>
      <outline type="rss" text="Other" xmlUrl="https://other.example/rss"/>
    </outline>
  </body>
</opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(
            feeds,
            vec![
                OpmlFeed {
                    title: "Example Blog".into(),
                    xml_url: "https://example.com/feed.xml".into(),
                },
                OpmlFeed {
                    title: "Other".into(),
                    xml_url: "https://other.example/rss".into(),
                },
            ]
        );
    }

    #[test]
    fn test_fallback_to_url() {
        let content = r#"<opml version="2.0"><body>
<outline type="rss" xmlUrl="https://notitle.com/feed"/>
<outline type="rss" title="  " text="From text" xmlUrl="https://text.example/feed"/>
</body></opml>"#;
        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds[0].title, "https://notitle.com/feed");
        assert_eq!(feeds[1].title, "From text");
    }

    #[test]
    fn test_invalid_urls_skipped() {
        let content = r#"<opml version="2.0"><body>
<outline text="Bad" xmlUrl="file:///etc/passwd"/>
<outline text="Good" xmlUrl="https://good.example/feed"/>
</body></opml>"#;
        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].title, "Good");
    }

    #[test]
    fn test_depth_limit() {
        let mut content = String::from("<opml><body>");
        for _ in 0..=MAX_OPML_DEPTH {
            content.push_str("<outline text=\"f\">");
        }
        for _ in 0..=MAX_OPML_DEPTH {
            content.push_str("</outline>");
        }
        content.push_str("</body></opml>");

        let err = parse_opml_content(&content).unwrap_err();
        assert!(matches!(err, OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH)));
    }

    #[test]
    fn test_sibling_folders_do_not_accumulate_depth() {
        let mut content = String::from("<opml><body>");
        for _ in 0..(MAX_OPML_DEPTH * 2) {
            content.push_str("<outline text=\"folder\"></outline>");
        }
        content.push_str("<outline text=\"A\" xmlUrl=\"https://a.example/rss\"/>");
        content.push_str("</body></opml>");

        let feeds = parse_opml_content(&content).unwrap();
        assert_eq!(feeds.len(), 1);
    }

    #[test]
    fn test_custom_entity_rejected() {
        let content = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<opml><body><outline text="&xxe;" xmlUrl="https://example.com/feed"/></body></opml>"#;
        let err = parse_opml_content(content).unwrap_err();
        assert!(matches!(err, OpmlError::XmlParse(_)));
    }

    #[tokio::test]
    async fn test_parse_missing_file_is_io_error() {
        let path = std::env::temp_dir().join(format!(
            "kiosk_opml_missing_{}.opml",
            std::process::id()
        ));
        let err = parse(&path).await.unwrap_err();
        assert!(matches!(err, OpmlError::Io(_)));
    }

    #[test]
    fn test_export_then_parse_preserves_order_and_escaping() {
        let feeds = vec![
            OpmlFeed {
                title: "Tom & Jerry's \"Feed\"".into(),
                xml_url: "https://example.com/a?x=1&y=2".into(),
            },
            OpmlFeed {
                title: "Second".into(),
                xml_url: "https://example.com/b".into(),
            },
        ];
        let xml = export_opml(&feeds).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<opml version=\"2.0\">"));
        assert!(xml.contains("<title>kiosk subscriptions</title>"));
        assert_eq!(parse_opml_content(&xml).unwrap(), feeds);
    }

    #[test]
    fn test_export_empty_list() {
        let xml = export_opml(&[]).unwrap();
        assert!(xml.contains("<body>"));
        assert!(parse_opml_content(&xml).unwrap().is_empty());
    }

    #[test]
    fn test_export_to_file_atomic() {
        let dir = std::env::temp_dir().join(format!("kiosk_opml_export_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feeds.opml");
        std::fs::write(&path, "old").unwrap();

        let feeds = vec![OpmlFeed {
            title: "One".into(),
            xml_url: "https://one.example/rss".into(),
        }];
        export_to_file(&feeds, &path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("https://one.example/rss"));
        // No temp files left behind
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let path = std::env::temp_dir()
            .join(format!("kiosk_opml_nodir_{}", std::process::id()))
            .join("feeds.opml");
        let feeds = vec![OpmlFeed {
            title: "One".into(),
            xml_url: "https://one.example/rss".into(),
        }];

        let err = export_to_file(&feeds, &path).unwrap_err();
        assert!(matches!(err, OpmlError::Io(_)));
        assert!(!path.exists());
    }
}
