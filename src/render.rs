//! Result rendering.
//!
//! Search results become Discord embeds: one header card with the query and
//! hit count, then one card per document. The `text` command renders a
//! single document through a minijinja template instead.

use catalogue_core::models::Document;
use catalogue_core::orchestrator::SearchOutcome;
use catalogue_core::CatalogueError;
use minijinja::{context, Environment};

use crate::discord::{truncate, Embed, EmbedAuthor, EmbedField, MAX_CONTENT_LEN, MAX_EMBEDS_PER_MESSAGE};

pub const BOT_NAME: &str = "ub-bot";
pub const DEFAULT_TEXT_TEMPLATE: &str = include_str!("../templates/text.md.j2");

const NETWORK_ID_PREFIX: &str = "(EXLNZ-41SLSP_NETWORK)";
const MAX_TITLE_LEN: usize = 256;

pub fn catalogue_search_url(query: &str) -> String {
    format!(
        "https://basel.swisscovery.org/discovery/search?query=any,contains,{}&tab=UBS&search_scope=UBS&vid=41SLSP_UBS:live&offset=0",
        urlencoding::encode(query)
    )
}

fn record_display_url(alma_id: &str) -> String {
    format!(
        "https://basel.swisscovery.org/discovery/fulldisplay?docid=alma{}&context=L&vid=41SLSP_UBS:live",
        alma_id
    )
}

/// Link to the record in the discovery UI.
///
/// Prefers the network identifier; falls back to a local `99…5504`
/// identifier.
pub fn record_url(doc: &Document) -> Option<String> {
    let ids = &doc.record_identifiers;
    ids.iter()
        .find_map(|id| id.strip_prefix(NETWORK_ID_PREFIX))
        .or_else(|| {
            ids.iter()
                .map(String::as_str)
                .find(|id| id.starts_with("99") && id.ends_with("5504") && id.len() >= 6)
        })
        .map(record_display_url)
}

/// The summary card above a result page.
pub fn header_embed(outcome: &SearchOutcome) -> Embed {
    let mut fields = vec![
        EmbedField {
            name: "Query".into(),
            value: outcome.query.clone(),
        },
        EmbedField {
            name: "Total Hits".into(),
            value: outcome.page.total.to_string(),
        },
    ];
    if !outcome.is_similarity() {
        fields.push(EmbedField {
            name: "Swisscovery Search".into(),
            value: catalogue_search_url(&outcome.query),
        });
    }
    Embed {
        author: Some(EmbedAuthor {
            name: BOT_NAME.into(),
        }),
        title: Some("Query Results".into()),
        fields,
    }
}

/// One result card. `index` is the document's position in the channel's
/// result buffer.
pub fn document_embed(index: usize, doc: &Document) -> Embed {
    let mut fields = Vec::new();
    if let Some(url) = record_url(doc) {
        fields.push(EmbedField {
            name: "Swisscovery".into(),
            value: url,
        });
    }
    for (role, persons) in &doc.persons {
        let value = persons
            .iter()
            .filter(|p| !p.name.trim().is_empty())
            .map(|p| match p.date.as_deref().filter(|d| !d.is_empty()) {
                Some(date) => format!("{} ({})", p.name, date),
                None => p.name.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        // Discord rejects the whole message over one empty field value.
        if value.is_empty() {
            continue;
        }
        fields.push(EmbedField {
            name: role.clone(),
            value,
        });
    }
    Embed {
        author: Some(EmbedAuthor {
            name: format!("{} - {:.6} - {}", index, doc.score, doc.id),
        }),
        title: Some(truncate(&doc.title, MAX_TITLE_LEN)),
        fields,
    }
}

/// Header plus one card per document, labelled from `first_index`.
pub fn outcome_embeds(outcome: &SearchOutcome) -> Vec<Embed> {
    std::iter::once(header_embed(outcome))
        .chain(
            outcome
                .page
                .docs
                .iter()
                .enumerate()
                .map(|(i, doc)| document_embed(outcome.first_index + i, doc)),
        )
        .collect()
}

/// Splits embeds into message-sized batches.
pub fn batch_embeds(embeds: Vec<Embed>) -> Vec<Vec<Embed>> {
    embeds
        .chunks(MAX_EMBEDS_PER_MESSAGE)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Plain-text document renderer for the `text` command.
pub struct TextRenderer {
    env: Environment<'static>,
}

const TEXT_TEMPLATE_NAME: &str = "text";

impl TextRenderer {
    /// Compiles `source`, failing early on syntax errors.
    pub fn new(source: String) -> Result<Self, CatalogueError> {
        let mut env = Environment::new();
        env.add_template_owned(TEXT_TEMPLATE_NAME, source)
            .map_err(|e| CatalogueError::Render(e.to_string()))?;
        Ok(Self { env })
    }

    pub fn with_default_template() -> Result<Self, CatalogueError> {
        Self::new(DEFAULT_TEXT_TEMPLATE.to_string())
    }

    pub fn render(&self, doc: &Document) -> Result<String, CatalogueError> {
        let text = self
            .env
            .get_template(TEXT_TEMPLATE_NAME)
            .and_then(|tmpl| {
                tmpl.render(context! {
                    id => &doc.id,
                    title => &doc.title,
                    score => doc.score,
                    persons => &doc.persons,
                    record_identifiers => &doc.record_identifiers,
                    url => record_url(doc),
                    source => &doc.source,
                })
            })
            .map_err(|e| CatalogueError::Render(e.to_string()))?;
        Ok(truncate(text.trim_end(), MAX_CONTENT_LEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogue_core::models::{Person, SearchMode, SearchPage};
    use std::collections::BTreeMap;

    fn faust() -> Document {
        let mut persons = BTreeMap::new();
        persons.insert(
            "author".to_string(),
            vec![
                Person {
                    name: "Goethe, Johann Wolfgang von".into(),
                    date: Some("1749-1832".into()),
                },
                Person {
                    name: "Anonymous".into(),
                    date: None,
                },
            ],
        );
        Document {
            id: "991170525505504".into(),
            title: "Faust".into(),
            score: 1.25,
            persons,
            record_identifiers: vec![
                "991170525505504".into(),
                "(EXLNZ-41SLSP_NETWORK)991082852209791".into(),
            ],
            ..Default::default()
        }
    }

    fn outcome(query: &str, docs: Vec<Document>, first_index: usize) -> SearchOutcome {
        SearchOutcome {
            page: SearchPage { total: 120, docs },
            first_index,
            query: query.into(),
            mode: SearchMode::Simple,
            embedding: None,
        }
    }

    #[test]
    fn test_record_url_prefers_network_id() {
        let url = record_url(&faust()).unwrap();
        assert!(url.contains("docid=alma991082852209791&"), "{}", url);

        let mut local_only = faust();
        let local_id = "9912345675504";
        local_only.record_identifiers = vec!["other".into(), local_id.into()];
        assert!(record_url(&local_only)
            .unwrap()
            .contains(&format!("docid=alma{}&", local_id)));

        local_only.record_identifiers = vec!["12345".into()];
        assert!(record_url(&local_only).is_none());
    }

    #[test]
    fn test_document_embed_layout() {
        let embed = document_embed(12, &faust());
        assert_eq!(
            embed.author.unwrap().name,
            "12 - 1.250000 - 991170525505504"
        );
        assert_eq!(embed.fields.len(), 2);
        assert_eq!(embed.fields[1].name, "author");
        assert_eq!(
            embed.fields[1].value,
            "Goethe, Johann Wolfgang von (1749-1832); Anonymous"
        );
    }

    #[test]
    fn test_roles_without_names_are_skipped() {
        let mut doc = faust();
        doc.persons.insert("editor".into(), Vec::new());
        doc.persons.insert(
            "translator".into(),
            vec![Person {
                name: " ".into(),
                date: Some("1900".into()),
            }],
        );
        let embed = document_embed(0, &doc);
        assert_eq!(embed.fields.len(), 2);
        assert!(embed.fields.iter().all(|f| !f.value.is_empty()));
        assert!(embed.fields.iter().all(|f| f.name != "editor" && f.name != "translator"));
    }

    #[test]
    fn test_long_title_is_truncated() {
        let mut doc = faust();
        doc.title = "x".repeat(300);
        let title = document_embed(0, &doc).title.unwrap();
        assert_eq!(title.chars().count(), 256);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_header_link_only_for_text_queries() {
        let header = header_embed(&outcome("goethe faust", vec![], 0));
        assert_eq!(header.fields.len(), 3);
        assert!(header.fields[2].value.contains("contains,goethe%20faust&"));

        let similar = header_embed(&outcome("similar:3 - Faust", vec![], 0));
        assert_eq!(similar.fields.len(), 2);
        assert_eq!(similar.fields[1].value, "120");
    }

    #[test]
    fn test_labels_continue_from_first_index() {
        let embeds = outcome_embeds(&outcome("q", vec![faust(), faust()], 9));
        assert_eq!(embeds.len(), 3);
        assert!(embeds[1].author.as_ref().unwrap().name.starts_with("9 - "));
        assert!(embeds[2].author.as_ref().unwrap().name.starts_with("10 - "));
    }

    #[test]
    fn test_batches_of_ten() {
        let batches = batch_embeds(vec![Embed::default(); 23]);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
    }

    #[test]
    fn test_default_text_template() {
        let text = TextRenderer::with_default_template().unwrap().render(&faust()).unwrap();
        assert!(text.starts_with("**Faust**"), "{}", text);
        assert!(text.contains("author: Goethe, Johann Wolfgang von (1749-1832); Anonymous"));
        assert!(text.contains("alma991082852209791"));
    }

    #[test]
    fn test_custom_template_and_syntax_error() {
        let renderer = TextRenderer::new("{{ id }}|{{ title|upper }}".into()).unwrap();
        assert_eq!(renderer.render(&faust()).unwrap(), "991170525505504|FAUST");
        assert!(matches!(
            TextRenderer::new("{% for %}".into()),
            Err(CatalogueError::Render(_))
        ));
    }

    #[test]
    fn test_text_output_is_capped() {
        let renderer = TextRenderer::new("{{ title }}".into()).unwrap();
        let mut doc = faust();
        doc.title = "y".repeat(5000);
        assert_eq!(renderer.render(&doc).unwrap().chars().count(), MAX_CONTENT_LEN);
    }
}
