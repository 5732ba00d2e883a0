//! HTML scraping connector: the fallback when the portal API is unusable.
//!
//! The listing page is walked as an event stream with `quick-xml` in a
//! lenient mode (unchecked end names, unquoted attributes, void elements
//! tracked by hand). A *card* is a `div`, `article`, or `li` whose class
//! mentions `grant`, `card`, or `item`; fields inside it are recognised by
//! tag and class:
//!
//! | Field | Tags | Class pattern |
//! |-------|------|---------------|
//! | title | `h2 h3 h4 a` | `title\|name` (falls back to the first heading) |
//! | description | `p div` | `description\|summary` |
//! | agency | `span div p` | `agency\|organisation` |
//! | deadline | `span div time p` | `date\|deadline\|closing` |
//! | funding | `span div p` | `funding\|amount\|budget` |
//! | categories | `span li a` | `tag\|category\|sector` |
//!
//! Nested cards are supported; the innermost card owns the fields. A card
//! without any title is reported in [`FetchOutcome::rejected`] when it looks
//! like a listing (a `grant` class, a data id, or any recognised field).
//! Untitled wrappers around other cards and navigation items are layout and
//! are skipped silently.

use anyhow::{bail, Result};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

use crate::config::PortalConfig;
use crate::connector_api::{build_client, get_with_retry};
use crate::models::RawGrant;
use crate::traits::{FetchOutcome, GrantSource};

pub struct ScrapeSource {
    client: reqwest::Client,
    listing_url: String,
    base_url: String,
    max_retries: u32,
}

impl ScrapeSource {
    pub fn new(portal: &PortalConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(portal)?,
            listing_url: portal.listing_url(),
            base_url: portal.base_url.clone(),
            max_retries: portal.max_retries,
        })
    }
}

#[async_trait]
impl GrantSource for ScrapeSource {
    fn name(&self) -> &str {
        "scrape"
    }

    async fn fetch(&self) -> Result<FetchOutcome> {
        let response = get_with_retry(&self.client, &self.listing_url, self.max_retries).await?;
        let html = response.text().await?;

        let outcome = parse_listing(&html, &self.base_url);
        if outcome.records.is_empty() {
            bail!(
                "no grant listings found at {} ({} untitled cards)",
                self.listing_url,
                outcome.rejected.len()
            );
        }
        Ok(outcome)
    }
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];
const CARD_TAGS: &[&str] = &["div", "article", "li"];
const HEADING_TAGS: &[&str] = &["h2", "h3", "h4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Description,
    Agency,
    Deadline,
    Funding,
    Category,
    Heading,
}

struct FieldRule {
    field: Field,
    tags: &'static [&'static str],
    class: Regex,
}

struct Rules {
    card: Regex,
    fields: Vec<FieldRule>,
    slug: Regex,
    noise: Regex,
}

fn rules() -> &'static Rules {
    static RULES: OnceLock<Rules> = OnceLock::new();
    RULES.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("static pattern");
        Rules {
            card: re(r"(?i)grant|card|item"),
            fields: vec![
                FieldRule {
                    field: Field::Title,
                    tags: &["h2", "h3", "h4", "a"],
                    class: re(r"(?i)title|name"),
                },
                FieldRule {
                    field: Field::Description,
                    tags: &["p", "div"],
                    class: re(r"(?i)description|summary"),
                },
                FieldRule {
                    field: Field::Agency,
                    tags: &["span", "div", "p"],
                    class: re(r"(?i)agency|organi[sz]ation"),
                },
                FieldRule {
                    field: Field::Deadline,
                    tags: &["span", "div", "time", "p"],
                    class: re(r"(?i)date|deadline|closing"),
                },
                FieldRule {
                    field: Field::Funding,
                    tags: &["span", "div", "p"],
                    class: re(r"(?i)funding|amount|budget"),
                },
                FieldRule {
                    field: Field::Category,
                    tags: &["span", "li", "a"],
                    class: re(r"(?i)tag|category|sector"),
                },
            ],
            slug: re(r"/grants/([^/?#]+)"),
            noise: re(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<!--.*?-->"),
        }
    })
}

#[derive(Default)]
struct CardBuilder {
    depth: usize,
    grant_class: bool,
    has_nested: bool,
    data_id: Option<String>,
    title: Option<String>,
    heading: Option<String>,
    description: Option<String>,
    agency: Option<String>,
    deadline: Option<String>,
    funding: Option<String>,
    categories: Vec<String>,
    link: Option<String>,
}

impl CardBuilder {
    fn looks_like_listing(&self) -> bool {
        !self.has_nested
            && (self.grant_class
                || self.data_id.as_deref().map_or(false, |id| !id.trim().is_empty())
                || self.description.is_some()
                || self.agency.is_some()
                || self.deadline.is_some()
                || self.funding.is_some()
                || !self.categories.is_empty())
    }

    fn into_raw(self, base_url: &str, rules: &Rules) -> Option<RawGrant> {
        let title = self.title.or(self.heading)?;
        let source_url = self.link.map(|l| absolutize(&l, base_url));
        let external_id = self
            .data_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| {
                source_url
                    .as_deref()
                    .and_then(|u| rules.slug.captures(u))
                    .map(|c| c[1].to_string())
            });

        Some(RawGrant {
            external_id,
            title: Some(title),
            description: self.description,
            agency_name: self.agency,
            closing_date: self.deadline,
            funding: self.funding,
            categories: self.categories,
            application_url: source_url.clone(),
            source_url,
            ..Default::default()
        })
    }
}

struct Capture {
    field: Field,
    depth: usize,
    card: usize,
    text: String,
}

/// Extract grant cards from a listing page. Untitled listing cards come back
/// as rejected entries.
pub fn parse_listing(html: &str, base_url: &str) -> FetchOutcome {
    let rules = rules();
    let cleaned = rules.noise.replace_all(html, " ").replace("&nbsp;", " ");

    let mut reader = Reader::from_str(&cleaned);
    {
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        config.trim_text(true);
    }

    let mut stack: Vec<String> = Vec::new();
    let mut cards: Vec<CardBuilder> = Vec::new();
    let mut capture: Option<Capture> = None;
    let mut out = FetchOutcome::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = tag_name(e.name().as_ref());
                let attrs = attributes(&e);
                let depth = if VOID_ELEMENTS.contains(&name.as_str()) {
                    None
                } else {
                    stack.push(name.clone());
                    Some(stack.len())
                };
                open_element(rules, &name, &attrs, depth, &mut cards, &mut capture);
            }
            Ok(Event::Empty(e)) => {
                let name = tag_name(e.name().as_ref());
                let attrs = attributes(&e);
                open_element(rules, &name, &attrs, None, &mut cards, &mut capture);
            }
            Ok(Event::Text(t)) => {
                if let Some(c) = capture.as_mut() {
                    let text = t
                        .unescape()
                        .map(|s| s.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                    push_text(&mut c.text, &text);
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(c) = capture.as_mut() {
                    push_text(&mut c.text, &String::from_utf8_lossy(&t));
                }
            }
            Ok(Event::End(e)) => {
                let name = tag_name(e.name().as_ref());
                if let Some(pos) = stack.iter().rposition(|open| *open == name) {
                    stack.truncate(pos);
                    close_to_depth(stack.len(), base_url, rules, &mut cards, &mut capture, &mut out);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(error = %e, "stopping listing parse early on malformed markup");
                break;
            }
            _ => {}
        }
    }

    close_to_depth(0, base_url, rules, &mut cards, &mut capture, &mut out);
    out
}

fn open_element(
    rules: &Rules,
    name: &str,
    attrs: &[(String, String)],
    depth: Option<usize>,
    cards: &mut Vec<CardBuilder>,
    capture: &mut Option<Capture>,
) {
    let class = attr(attrs, "class").unwrap_or("");

    if cards.is_empty() {
        if let Some(depth) = depth {
            if CARD_TAGS.contains(&name) && rules.card.is_match(class) {
                cards.push(new_card(depth, attrs));
            }
        }
        return;
    }

    let idx = cards.len() - 1;
    {
        let card = &mut cards[idx];
        if name == "a" && card.link.is_none() {
            if let Some(href) = attr(attrs, "href").map(str::trim) {
                if !href.is_empty() && !href.starts_with('#') {
                    card.link = Some(href.to_string());
                }
            }
        }
        if name == "time" && card.deadline.is_none() {
            if let Some(dt) = attr(attrs, "datetime").map(str::trim) {
                if !dt.is_empty() {
                    card.deadline = Some(dt.to_string());
                }
            }
        }
    }

    let Some(depth) = depth else { return };
    if capture.is_some() {
        return;
    }

    let field_rule = if class.is_empty() {
        None
    } else {
        rules
            .fields
            .iter()
            .find(|r| r.tags.contains(&name) && r.class.is_match(class))
    };

    if let Some(rule) = field_rule {
        *capture = Some(Capture {
            field: rule.field,
            depth,
            card: idx,
            text: String::new(),
        });
    } else if CARD_TAGS.contains(&name) && rules.card.is_match(class) {
        cards[idx].has_nested = true;
        cards.push(new_card(depth, attrs));
    } else if HEADING_TAGS.contains(&name) && cards[idx].heading.is_none() {
        *capture = Some(Capture {
            field: Field::Heading,
            depth,
            card: idx,
            text: String::new(),
        });
    }
}

fn new_card(depth: usize, attrs: &[(String, String)]) -> CardBuilder {
    CardBuilder {
        depth,
        grant_class: attr(attrs, "class")
            .map_or(false, |c| c.to_ascii_lowercase().contains("grant")),
        data_id: attr(attrs, "data-id")
            .or_else(|| attr(attrs, "data-grant-id"))
            .map(|s| s.trim().to_string()),
        ..Default::default()
    }
}

fn close_to_depth(
    depth: usize,
    base_url: &str,
    rules: &Rules,
    cards: &mut Vec<CardBuilder>,
    capture: &mut Option<Capture>,
    out: &mut FetchOutcome,
) {
    if capture.as_ref().map_or(false, |c| c.depth > depth) {
        if let Some(c) = capture.take() {
            finish_capture(c, cards);
        }
    }

    while let Some(card) = cards.pop() {
        if card.depth <= depth {
            cards.push(card);
            break;
        }
        if card.title.is_none() && card.heading.is_none() {
            if card.looks_like_listing() {
                let position = out.records.len() + out.rejected.len() + 1;
                let label = card
                    .data_id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| format!("card #{}", position));
                out.rejected.push(format!("{}: no title", label));
            }
            continue;
        }
        if let Some(raw) = card.into_raw(base_url, rules) {
            out.records.push(raw);
        }
    }
}

fn finish_capture(capture: Capture, cards: &mut [CardBuilder]) {
    let text = capture.text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return;
    }
    let Some(card) = cards.get_mut(capture.card) else {
        return;
    };
    let slot = match capture.field {
        Field::Title => &mut card.title,
        Field::Heading => &mut card.heading,
        Field::Description => &mut card.description,
        Field::Agency => &mut card.agency,
        Field::Deadline => &mut card.deadline,
        Field::Funding => &mut card.funding,
        Field::Category => {
            card.categories.push(text);
            return;
        }
    };
    if slot.is_none() {
        *slot = Some(text);
    }
}

fn push_text(buf: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(text);
}

fn tag_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}

fn attributes(e: &BytesStart) -> Vec<(String, String)> {
    e.html_attributes()
        .flatten()
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).to_ascii_lowercase();
            let value = a
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
            (key, value)
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn absolutize(link: &str, base_url: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else if let Some(rest) = link.strip_prefix("//") {
        format!("https://{}", rest)
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            link.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://portal.example.gov";

    const LISTING: &str = r#"<!DOCTYPE html>
<html lang=en>
<head>
  <meta charset="utf-8">
  <title>Grants</title>
  <script>if (a < b && c) { render("<div class='grant-card'>"); }</script>
  <style>.grant-card { color: red; }</style>
</head>
<body>
  <nav><ul><li class="nav-item"><a href="/about">About</a></li></ul></nav>
  <div class="grant-list">
    <article class="grant-card" data-id="SG-100">
      <h3 class="grant-title"><a href="/grants/community-care/instruction">Community Care Innovation Fund</a></h3>
      <p class="grant-description">Supports community care programmes for seniors.<br>Includes dementia&nbsp;care.</p>
      <span class="agency-name">Agency for Integrated Care</span>
      <span class="closing-date">Closes: 15 Mar 2027</span>
      <span class="funding-amount">$80K - $150K</span>
      <ul><li class="tag">Eldercare</li><li class="tag">Dementia</li></ul>
    </article>
    <article class="grant-card">
      <h2>Technology for Seniors Grant</h2>
      <div class="summary">Technology solutions for seniors.</div>
      <a class="more" href="https://portal.example.gov/grants/tech-seniors/">Details</a>
      <time datetime="2027-03-31">31 March 2027</time>
    </article>
    <div class="grant-card"><p>Card without any heading</p></div>
  </div>
</body>
</html>"#;

    #[test]
    fn test_parses_cards_with_fields() {
        let grants = parse_listing(LISTING, BASE).records;
        assert_eq!(grants.len(), 2, "got {:?}", grants);

        let first = &grants[0];
        assert_eq!(first.external_id.as_deref(), Some("SG-100"));
        assert_eq!(first.title.as_deref(), Some("Community Care Innovation Fund"));
        assert_eq!(
            first.description.as_deref(),
            Some("Supports community care programmes for seniors. Includes dementia care.")
        );
        assert_eq!(first.agency_name.as_deref(), Some("Agency for Integrated Care"));
        assert_eq!(first.closing_date.as_deref(), Some("Closes: 15 Mar 2027"));
        assert_eq!(first.funding.as_deref(), Some("$80K - $150K"));
        assert_eq!(first.categories, vec!["Eldercare", "Dementia"]);
        assert_eq!(
            first.source_url.as_deref(),
            Some("https://portal.example.gov/grants/community-care/instruction")
        );
    }

    #[test]
    fn test_heading_fallback_and_slug_id() {
        let grants = parse_listing(LISTING, BASE).records;
        let second = &grants[1];
        assert_eq!(second.title.as_deref(), Some("Technology for Seniors Grant"));
        assert_eq!(second.external_id.as_deref(), Some("tech-seniors"));
        assert_eq!(second.description.as_deref(), Some("Technology solutions for seniors."));
        assert_eq!(second.closing_date.as_deref(), Some("2027-03-31"));
    }

    #[test]
    fn test_untitled_grant_card_is_rejected_and_layout_ignored() {
        let outcome = parse_listing(LISTING, BASE);
        assert!(outcome
            .records
            .iter()
            .all(|g| g.title.as_deref() != Some("About") && g.title.is_some()));
        assert_eq!(outcome.rejected, vec!["card #3: no title"]);
    }

    #[test]
    fn test_untitled_card_with_fields_is_rejected_by_id() {
        let html = r#"<ul>
          <li class="grant-item" data-id="SG-7"><span class="closing-date">1 May 2027</span></li>
          <li class="menu-item"><a href="/help">Help</a></li>
        </ul>"#;
        let outcome = parse_listing(html, BASE);
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.rejected, vec!["SG-7: no title"]);
    }

    #[test]
    fn test_page_without_cards_is_empty() {
        let html = "<html><body><h1>Maintenance</h1><p>Back soon.</p></body></html>";
        let outcome = parse_listing(html, BASE);
        assert!(outcome.records.is_empty());
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_absolutize() {
        assert_eq!(absolutize("/grants/x", "https://a.gov/"), "https://a.gov/grants/x");
        assert_eq!(absolutize("grants/x", "https://a.gov"), "https://a.gov/grants/x");
        assert_eq!(absolutize("https://b.gov/y", "https://a.gov"), "https://b.gov/y");
        assert_eq!(absolutize("//cdn.gov/z", "https://a.gov"), "https://cdn.gov/z");
    }
}
