//! Structure filter translation (§4.9 steps 1-3): turns a classified intent
//! into a `chunk_index` range filter by walking a document's stored section
//! tree.

use crate::intent::{IntentType, QueryIntent, SectionType};
use crate::storage::filter::{Filter, RangeValue};
use crate::storage::lexical::canonicalize_section_id;
use crate::types::{DocumentSectionNode, DocumentStructure, DocumentSummary};

fn document_type_for(section_type: SectionType) -> &'static str {
    match section_type {
        SectionType::Question => "tma_questions",
        SectionType::Section => "textbook_chapter",
        SectionType::Chapter => "textbook_chapter",
    }
}

fn resolve_document<'a>(intent: &QueryIntent, documents: &'a [DocumentSummary]) -> Option<&'a DocumentSummary> {
    if documents.is_empty() {
        return None;
    }

    if let Some(name) = &intent.document_name {
        let needle = name.to_lowercase();
        if let Some(found) = documents.iter().find(|d| d.filename.to_lowercase().contains(&needle)) {
            return Some(found);
        }
    }

    if documents.len() == 1 {
        return Some(&documents[0]);
    }

    if let Some(section_type) = intent.section_type {
        let wanted = document_type_for(section_type);
        if let Some(found) = documents.iter().find(|d| d.structure.as_ref().map(|s| s.document_type == wanted).unwrap_or(false)) {
            return Some(found);
        }
    }

    if let Some(found) = documents.iter().find(|d| d.structure.is_some()) {
        return Some(found);
    }

    documents.first()
}

fn find_node<'a>(nodes: &'a [DocumentSectionNode], intent: &QueryIntent) -> Option<&'a DocumentSectionNode> {
    let wanted_section_id = intent.section_id.as_ref().map(|s| canonicalize_section_id(s));

    for node in nodes {
        let type_matches = intent
            .section_type
            .map(|t| node.section_type == format!("{t:?}").to_lowercase())
            .unwrap_or(false);
        let number_matches = intent
            .section_number
            .as_ref()
            .map(|n| node.metadata.get("question_number").and_then(|v| v.as_str()).map(|v| v == n).unwrap_or(false))
            .unwrap_or(false);

        if type_matches && number_matches {
            return Some(node);
        }

        if let Some(wanted) = &wanted_section_id {
            if canonicalize_section_id(&node.id) == *wanted {
                return Some(node);
            }
        }

        if let Some(found) = find_node(&node.subsections, intent) {
            return Some(found);
        }
    }
    None
}

fn structure_of<'a>(document: &'a DocumentSummary) -> Option<&'a DocumentStructure> {
    document.structure.as_ref()
}

/// §4.9: returns `None` below the confidence threshold or for non-structured
/// intents, and whenever a matching node lacks a valid chunk range.
pub fn resolve_structure_filter(intent: &QueryIntent, documents: &[DocumentSummary]) -> Option<Filter> {
    if intent.intent_type != IntentType::StructuredSearch || intent.confidence < 0.6 {
        return None;
    }

    let document = resolve_document(intent, documents)?;
    let structure = structure_of(document)?;
    let node = find_node(&structure.sections, intent)?;

    let (Some(start), Some(end)) = (node.chunk_start, node.chunk_end) else { return None };

    Some(
        Filter::new()
            .with_eq("document_id", document.id.to_string())
            .with_range("chunk_index", RangeValue { gte: Some(start as i64), lte: Some(end as i64), ..Default::default() }),
    )
}
