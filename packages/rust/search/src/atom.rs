//! Atom feed parsing for arXiv API responses.

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::json;

use paperpipe_shared::{PaperMetadata, PaperPipeError, Result};

/// The identifier of an Atom entry: last path segment of its id URL, without
/// a trailing `.pdf`.
///
/// `http://arxiv.org/abs/2101.00001v1` becomes `2101.00001v1`.
pub fn identifier_from_entry_id(entry_id: &str) -> String {
    let last = entry_id
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    last.strip_suffix(".pdf").unwrap_or(last).to_string()
}

/// Parse an arXiv Atom feed into paper metadata, in feed order.
///
/// Entries without an id are skipped.
pub fn parse_feed(xml: &str) -> Result<Vec<PaperMetadata>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut papers = Vec::new();
    let mut entry: Option<EntryBuilder> = None;
    let mut field = Field::None;
    let mut in_author = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"entry" {
                    entry = Some(EntryBuilder::default());
                    field = Field::None;
                } else if let Some(builder) = entry.as_mut() {
                    match name.as_ref() {
                        b"author" => in_author = true,
                        b"link" => builder.add_link(&e),
                        b"category" => builder.add_category(&e),
                        other => field = Field::from_tag(other, in_author),
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(builder) = entry.as_mut() {
                    match e.local_name().as_ref() {
                        b"link" => builder.add_link(&e),
                        b"category" => builder.add_category(&e),
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(builder) = entry.as_mut() {
                    let text = t.unescape().map_err(|e| {
                        PaperPipeError::parse(format!("invalid text in Atom entry: {e}"))
                    })?;
                    builder.push_text(field, &text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"entry" => {
                    if let Some(meta) = entry.take().and_then(EntryBuilder::finish) {
                        papers.push(meta);
                    }
                    field = Field::None;
                }
                b"author" => {
                    in_author = false;
                    if let Some(builder) = entry.as_mut() {
                        builder.finish_author();
                    }
                }
                _ => field = Field::None,
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(PaperPipeError::parse(format!(
                    "invalid Atom feed at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }

    Ok(papers)
}

/// Which entry child the current text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Id,
    Title,
    Summary,
    Published,
    AuthorName,
    Doi,
}

impl Field {
    fn from_tag(tag: &[u8], in_author: bool) -> Self {
        match tag {
            b"id" => Self::Id,
            b"title" => Self::Title,
            b"summary" => Self::Summary,
            b"published" => Self::Published,
            b"name" if in_author => Self::AuthorName,
            b"doi" => Self::Doi,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Default)]
struct EntryBuilder {
    id: String,
    title: String,
    summary: String,
    published: String,
    doi: String,
    author_name: String,
    authors: Vec<String>,
    categories: Vec<String>,
    pdf_url: Option<String>,
}

impl EntryBuilder {
    fn push_text(&mut self, field: Field, text: &str) {
        let target = match field {
            Field::Id => &mut self.id,
            Field::Title => &mut self.title,
            Field::Summary => &mut self.summary,
            Field::Published => &mut self.published,
            Field::AuthorName => &mut self.author_name,
            Field::Doi => &mut self.doi,
            Field::None => return,
        };
        target.push_str(text);
    }

    fn finish_author(&mut self) {
        let name = collapse_whitespace(&self.author_name);
        if !name.is_empty() {
            self.authors.push(name);
        }
        self.author_name.clear();
    }

    fn add_link(&mut self, e: &BytesStart<'_>) {
        let mut href = None;
        let mut is_pdf = false;
        for attr in e.attributes().flatten() {
            match attr.key.as_ref() {
                b"href" => href = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                b"title" => is_pdf = attr.value.as_ref() == b"pdf",
                _ => {}
            }
        }
        if is_pdf {
            self.pdf_url = href;
        }
    }

    fn add_category(&mut self, e: &BytesStart<'_>) {
        for attr in e.attributes().flatten() {
            if attr.key.as_ref() == b"term" {
                self.categories
                    .push(String::from_utf8_lossy(&attr.value).into_owned());
            }
        }
    }

    fn finish(self) -> Option<PaperMetadata> {
        let entry_id = self.id.trim().to_string();
        let identifier = identifier_from_entry_id(&entry_id);
        if identifier.is_empty() {
            return None;
        }

        let summary = collapse_whitespace(&self.summary);
        let published = DateTime::parse_from_rfc3339(self.published.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc));

        let mut raw = json!({ "entry_id": entry_id });
        if !self.categories.is_empty() {
            raw["categories"] = json!(self.categories);
        }
        let doi = self.doi.trim();
        if !doi.is_empty() {
            raw["doi"] = json!(doi);
        }

        Some(PaperMetadata {
            identifier,
            title: collapse_whitespace(&self.title),
            authors: self.authors,
            summary: (!summary.is_empty()).then_some(summary),
            published,
            pdf_url: self.pdf_url,
            raw,
        })
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
