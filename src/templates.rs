//! Prompt templates for the orchestrator and intent extraction (§4.9, §4.10).
//! Reworded in this crate's own voice; none of these are literal copies of
//! any upstream prompt text.

/// Default system prompt handed to the LLM provider ahead of the conversation
/// history and the final context/question message.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a knowledgeable assistant answering questions strictly from the \
supplied context. Base every claim on the provided sources; if the context \
does not contain enough information to answer, say so plainly instead of \
guessing. When useful, mention which source a fact came from.";

/// System prompt for the optional self-check pass (§4.10).
pub const VALIDATOR_SYSTEM_PROMPT: &str = "\
You are reviewing a draft answer against the context it was generated from. \
Check the draft for claims unsupported by the context, and rewrite it to be \
accurate and well-grounded. Return only the corrected answer text, with no \
commentary about the review itself.";

pub fn validator_user_message(question: &str, draft_answer: &str, context: &str) -> String {
    format!(
        "<question>{question}</question>\n<draft_answer>{draft_answer}</draft_answer>\n<context>{context}</context>\n\nProvide the corrected answer."
    )
}

/// §4.9 intent extraction prompt. Grounded on the field list and JSON-only
/// instruction of the system this spec was distilled from, reworded.
pub fn intent_extraction_prompt(question: &str, document_names: &[String]) -> String {
    let documents = if document_names.is_empty() {
        "(no documents available)".to_string()
    } else {
        document_names.iter().map(|d| format!("- {d}")).collect::<Vec<_>>().join("\n")
    };

    format!(
        "Classify the following question against the documents in this knowledge base.\n\n\
Documents:\n{documents}\n\n\
Question: {question}\n\n\
Respond with a single JSON object with these fields:\n\
- intent_type: one of \"structured_search\", \"semantic_search\", \"unknown\"\n\
- document_name: the best-matching document name, if the question clearly targets one\n\
- section_type: one of \"question\", \"section\", \"chapter\", if the question targets a specific part of a document\n\
- section_number: the section/question number referenced, if any\n\
- section_id: a stable identifier for the section, if any\n\
- confidence: your confidence in this classification, from 0 to 1\n\n\
Respond with JSON only, no other text."
    )
}

fn show_verbatim_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(show|display|give|list)\b.{0,40}\bquestion\s+\d+").expect("static regex is valid")
    })
}

/// §4.10 step 4: detect a "show verbatim question N" request to append the
/// extra instruction asking the model to reproduce it exactly.
pub fn wants_verbatim_question(question: &str) -> bool {
    show_verbatim_regex().is_match(question)
}

/// Final user message wrapping the assembled context and the question, with
/// the verbatim-reproduction instruction appended when applicable.
pub fn final_user_message(context: &str, question: &str) -> String {
    let mut message = format!("<context>\n{context}\n</context>\n<question>\n{question}\n</question>");
    if wants_verbatim_question(question) {
        message.push_str(
            "\n\nIf the context contains the exact text of the referenced question, reproduce it verbatim before answering.",
        );
    }
    message
}

pub const NO_CONTEXT_ANSWER: &str = "I don't have relevant information in the knowledge base to answer this question.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_show_verbatim_question_requests() {
        assert!(wants_verbatim_question("please show question 4 exactly"));
        assert!(wants_verbatim_question("Can you list Question 12?"));
    }

    #[test]
    fn ordinary_questions_do_not_trigger_verbatim_mode() {
        assert!(!wants_verbatim_question("what is the capital of France?"));
    }

    #[test]
    fn intent_prompt_includes_all_document_names() {
        let prompt = intent_extraction_prompt("q", &["a.txt".to_string(), "b.txt".to_string()]);
        assert!(prompt.contains("a.txt"));
        assert!(prompt.contains("b.txt"));
    }
}
