//! Prompt templating. Everything here is pure string assembly: identical
//! inputs always produce byte-identical prompts.

use crate::chunker::Chunk;

const PREAMBLE: &str = "You are a friendly and helpful expert assistant.

If the question is a greeting or casual conversation (like \"hello\", \"how are you\", \"goodbye\"), respond naturally and conversationally.

Use the following pieces of context to answer the question at the end.
Pay special attention to publication dates, author names, journal names, and paper titles in the context.
For questions about dates or timelines (like \"latest paper\" or \"papers from 2017\"), carefully check the publication years/dates in the metadata of each source.
";

const TIMELINE_GUIDANCE: &str = "
If asked to summarize or describe papers from a specific year, look for papers with that publication year in their metadata.
If asked about the latest paper, identify the paper with the most recent publication date.
";

const CLOSING: &str = "
If you don't know the answer or the information isn't in the context, just say that you don't know, don't try to make up an answer.
";

const CONDENSE_TEMPLATE: &str = "Given the following conversation and a follow up question, rephrase the follow up question to be a standalone question, in its original language.

Chat History:
";

const DOCUMENT_SEPARATOR: &str = "\n\n";

/// Which question-answering template to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    SingleTurn,
    Conversational,
}

/// Renders one chunk behind its paper's metadata header.
pub fn format_chunk(chunk: &Chunk) -> String {
    let meta = &chunk.metadata;
    format!(
        "## MAIN PAPER METADATA:\n\
         Title: {}\n\
         Authors: {}\n\
         Year: {}\n\
         Journal: {}\n\
         Source: {}\n\n\
         ## CONTENT:\n{}",
        meta.title,
        meta.authors_or_unknown(),
        meta.year,
        meta.journal,
        meta.source,
        chunk.text
    )
}

pub fn format_sources(chunks: &[Chunk]) -> Vec<String> {
    chunks.iter().map(format_chunk).collect()
}

/// Assembles the answer prompt from retrieved chunks, an optional rendered
/// history and the user's question.
pub fn build_prompt(
    style: PromptStyle,
    chunks: &[Chunk],
    question: &str,
    history: Option<&str>,
) -> String {
    let mut prompt = String::from(PREAMBLE);
    if style == PromptStyle::Conversational {
        prompt.push_str(TIMELINE_GUIDANCE);
    }
    prompt.push_str(CLOSING);
    prompt.push('\n');
    prompt.push_str(&format_sources(chunks).join(DOCUMENT_SEPARATOR));
    prompt.push_str("\n\n");
    if let Some(history) = history.filter(|h| !h.is_empty()) {
        prompt.push_str("Chat History:\n");
        prompt.push_str(history);
        prompt.push('\n');
    }
    prompt.push_str("Question: ");
    prompt.push_str(question);
    prompt.push('\n');
    prompt
}

/// Prompt asking the model to rewrite a follow-up into a standalone question.
pub fn build_condense_prompt(history: &str, question: &str) -> String {
    format!("{CONDENSE_TEMPLATE}{history}\nFollow Up Input: {question}\nStandalone question:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::PaperMetadata;

    fn chunk(file: &str, text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            start: 0,
            index: 0,
            page: 0,
            metadata: PaperMetadata::from_file_name(file),
        }
    }

    #[test]
    fn test_format_chunk_header() {
        let rendered = format_chunk(&chunk("study_NatureML_2021.pdf", "Autoencoders."));
        assert_eq!(
            rendered,
            "## MAIN PAPER METADATA:\nTitle: study_NatureML_2021\nAuthors: Unknown\nYear: 2021\n\
             Journal: NatureML\nSource: study_NatureML_2021.pdf\n\n## CONTENT:\nAutoencoders."
        );
    }

    #[test]
    fn test_single_turn_layout() {
        let chunks = [chunk("a_X_2001.pdf", "first"), chunk("b_Y_2002.pdf", "second")];
        let prompt = build_prompt(PromptStyle::SingleTurn, &chunks, "What is new?", None);

        assert!(prompt.starts_with("You are a friendly and helpful expert assistant."));
        assert!(!prompt.contains("latest paper, identify"));
        assert!(prompt.contains("## CONTENT:\nfirst\n\n## MAIN PAPER METADATA:\nTitle: b_Y_2002"));
        assert!(prompt.ends_with("## CONTENT:\nsecond\n\nQuestion: What is new?\n"));
        let first = prompt.find("a_X_2001").unwrap();
        let second = prompt.find("b_Y_2002").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_conversational_adds_guidance_and_history() {
        let chunks = [chunk("a_X_2001.pdf", "first")];
        let history = "Human: hi\nAI: hello\n";
        let prompt = build_prompt(PromptStyle::Conversational, &chunks, "And 2017?", Some(history));
        assert!(prompt.contains("If asked about the latest paper, identify the paper"));
        assert!(prompt.ends_with("Chat History:\nHuman: hi\nAI: hello\n\nQuestion: And 2017?\n"));
    }

    #[test]
    fn test_empty_history_is_omitted() {
        let with_empty = build_prompt(PromptStyle::Conversational, &[], "q", Some(""));
        let without = build_prompt(PromptStyle::Conversational, &[], "q", None);
        assert_eq!(with_empty, without);
        assert!(!without.contains("Chat History"));
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let chunks = [chunk("a_X_2001.pdf", "first")];
        let a = build_prompt(PromptStyle::SingleTurn, &chunks, "q", None);
        let b = build_prompt(PromptStyle::SingleTurn, &chunks, "q", None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_condense_prompt() {
        let prompt = build_condense_prompt("Human: tell me about ae\nAI: sure\n", "what year?");
        assert!(prompt.starts_with("Given the following conversation"));
        assert!(prompt.ends_with("AI: sure\n\nFollow Up Input: what year?\nStandalone question:"));
    }
}
