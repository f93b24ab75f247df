use quick_xml::events::Event;
use quick_xml::name::{Namespace, QName, ResolveResult};
use quick_xml::NsReader;
use std::borrow::Cow;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::article::Article;
use crate::util::clean_fragment;

/// Element that delimits one article record in RSS and RDF feeds.
const ITEM: &str = "item";

const RSS_090_NS: &[u8] = b"http://my.netscape.com/rdf/simple/0.9/";
const RSS_10_NS: &[u8] = b"http://purl.org/rss/1.0/";
const DUBLIN_CORE_NS: &[u8] = b"http://purl.org/dc/elements/1.1/";

/// Errors produced while turning a feed body into articles.
///
/// Any of these means the whole document is rejected: no partially
/// collected articles are returned alongside an error.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The tokenizer reported malformed XML (bad syntax, mismatched tags,
    /// undecodable text, unknown entity).
    #[error("Malformed XML at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    /// The document ended while an element was still open.
    #[error("Document ended inside unclosed <{0}>")]
    UnclosedElement(String),
    /// The input held no element at all (empty body, plain text, HTML error page fragment).
    #[error("Document contains no XML elements")]
    NoRootElement,
    /// `finish` was called after the parser had already failed.
    #[error("Parser already reported an error")]
    AlreadyFailed,
}

/// Lifecycle of a [`FeedParser`].
///
/// `Idle` → `InItem` on `<item>`, back to `Idle` on `</item>`.
/// End of document moves to `Success`, any error to `Error`; both are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Idle,
    InItem,
    Success,
    Error,
}

/// Per-item fields collected between `<item>` and `</item>`.
#[derive(Debug, Default)]
struct ItemAccumulator {
    title: String,
    description: String,
    link: String,
    pub_date: String,
    creator: String,
    categories: Vec<Arc<str>>,
}

impl ItemAccumulator {
    fn append(&mut self, element: &str, text: &str) {
        match element {
            "title" => self.title.push_str(text),
            "description" => self.description.push_str(text),
            "link" => self.link.push_str(text),
            "pubDate" => self.pub_date.push_str(text),
            "creator" => self.creator.push_str(text),
            "category" if !text.is_empty() => self.categories.push(Arc::from(text)),
            _ => {}
        }
    }

    fn into_article(self) -> Article {
        Article {
            id: Uuid::new_v4(),
            title: Arc::from(self.title),
            description: Arc::from(self.description),
            link: Arc::from(self.link),
            pub_date: Arc::from(self.pub_date),
            creator: Arc::from(self.creator),
            categories: if self.categories.is_empty() {
                None
            } else {
                Some(self.categories)
            },
        }
    }
}

/// Event-driven feed state machine.
///
/// Fed start/end/character events by [`parse_feed`], but usable directly
/// with any tokenizer. Text is routed by the innermost open element, and
/// several fragments for one element concatenate in arrival order.
/// [`parse_feed`] passes RSS and Dublin Core elements by local name
/// (`dc:creator` arrives as `creator`) and every other element by its
/// qualified name, which matches no field.
#[derive(Debug)]
pub struct FeedParser {
    state: ParserState,
    open_elements: Vec<String>,
    item: ItemAccumulator,
    articles: Vec<Article>,
    saw_element: bool,
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Idle,
            open_elements: Vec::new(),
            item: ItemAccumulator::default(),
            articles: Vec::new(),
            saw_element: false,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, ParserState::Success | ParserState::Error)
    }

    pub fn start_element(&mut self, name: &str) {
        if self.is_finished() {
            return;
        }
        self.saw_element = true;
        if name == ITEM {
            self.item = ItemAccumulator::default();
            self.state = ParserState::InItem;
        }
        self.open_elements.push(name.to_owned());
    }

    pub fn end_element(&mut self, name: &str) {
        if self.is_finished() {
            return;
        }
        // Tag balance is the tokenizer's job; we only track nesting.
        self.open_elements.pop();
        if name == ITEM && self.state == ParserState::InItem {
            let item = std::mem::take(&mut self.item);
            self.articles.push(item.into_article());
            self.state = ParserState::Idle;
        }
    }

    /// Handles one character-data fragment (text or CDATA).
    ///
    /// Text outside an item, or directly inside `<item>`, is ignored.
    pub fn characters(&mut self, fragment: &str) {
        if self.state != ParserState::InItem {
            return;
        }
        let Some(element) = self.open_elements.last() else {
            return;
        };
        let text = clean_fragment(fragment);
        self.item.append(element, &text);
    }

    /// Moves to `Error`, discarding everything collected so far.
    pub fn fail(&mut self, err: ParseError) -> ParseError {
        self.state = ParserState::Error;
        self.articles.clear();
        self.open_elements.clear();
        self.item = ItemAccumulator::default();
        err
    }

    /// Handles end of document and yields the articles in source order.
    pub fn finish(&mut self) -> Result<Vec<Article>, ParseError> {
        match self.state {
            ParserState::Error => return Err(ParseError::AlreadyFailed),
            ParserState::Success => return Ok(Vec::new()),
            ParserState::Idle | ParserState::InItem => {}
        }
        if let Some(open) = self.open_elements.last().cloned() {
            return Err(self.fail(ParseError::UnclosedElement(open)));
        }
        if !self.saw_element {
            return Err(self.fail(ParseError::NoRootElement));
        }
        self.state = ParserState::Success;
        Ok(std::mem::take(&mut self.articles))
    }
}

/// Name under which an element reaches the state machine.
///
/// Item fields count only without a namespace or in the RSS 0.90/1.0
/// namespaces, and `creator` only in Dublin Core (an undeclared `dc:`
/// prefix is tolerated). Other elements keep their qualified name, so
/// `media:title` never feeds the article title.
fn element_name(reader: &NsReader<&[u8]>, qname: QName<'_>) -> String {
    let (ns, local) = reader.resolve_element(qname);
    let local = local.as_ref();
    let recognized = match ns {
        ResolveResult::Unbound => true,
        ResolveResult::Bound(Namespace(uri)) if local == b"creator" => uri == DUBLIN_CORE_NS,
        ResolveResult::Bound(Namespace(uri)) => uri == RSS_10_NS || uri == RSS_090_NS,
        ResolveResult::Unknown(prefix) => local == b"creator" && prefix.as_slice() == b"dc",
    };
    let name = if recognized { local } else { qname.as_ref() };
    String::from_utf8_lossy(name).into_owned()
}

/// Parses a complete RSS or RDF document into articles.
///
/// Recognized item children are `title`, `description`, `link`, `pubDate`,
/// `creator` and `category`; everything else is skipped. A document with
/// zero items is a success with an empty list.
///
/// # Errors
///
/// Returns [`ParseError`] for malformed XML, a truncated document, or input
/// with no elements. No articles are returned in that case.
///
/// # Security
///
/// SEC-002: quick-xml (0.37) does not expand `<!ENTITY>` declarations, so
/// XXE payloads surface as unknown-entity errors instead of being resolved.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<Article>, ParseError> {
    // Text is left untrimmed here: each fragment is cleaned on its own so
    // that split fragments still join in order.
    // The declared encoding (ISO-8859-1, windows-1252, ...) drives decoding
    let mut reader = NsReader::from_reader(bytes);
    let mut parser = FeedParser::new();

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(source) => {
                let position = reader.buffer_position() as u64;
                return Err(parser.fail(ParseError::Xml { position, source }));
            }
        };

        match event {
            Event::Start(e) => parser.start_element(&element_name(&reader, e.name())),
            Event::Empty(e) => {
                let name = element_name(&reader, e.name());
                parser.start_element(&name);
                parser.end_element(&name);
            }
            Event::End(e) => parser.end_element(&element_name(&reader, e.name())),
            Event::Text(t) => match t.unescape() {
                Ok(text) => parser.characters(&text),
                Err(e) => {
                    let position = reader.buffer_position() as u64;
                    return Err(parser.fail(ParseError::Xml {
                        position,
                        source: e.into(),
                    }));
                }
            },
            Event::CData(c) => {
                let decoded: Result<Cow<'_, str>, _> = reader.decoder().decode(&c);
                match decoded {
                    Ok(text) => parser.characters(&text),
                    Err(e) => {
                        let position = reader.buffer_position() as u64;
                        return Err(parser.fail(ParseError::Xml {
                            position,
                            source: e.into(),
                        }));
                    }
                }
            }
            Event::Eof => return parser.finish(),
            _ => {}
        }
    }
}
