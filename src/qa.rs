use tracing::{debug, info};

use crate::chunker::Chunk;
use crate::error::QaError;
use crate::llm::{Generator, LLMConfig};
use crate::prompt::{PromptStyle, build_condense_prompt, build_prompt, format_sources};
use crate::retriever::Retriever;
use crate::utils::preview;

/// A generated answer with the chunks it was grounded on.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<Chunk>,
    /// The rewritten question used for retrieval, when one was produced.
    pub standalone_question: Option<String>,
}

impl Answer {
    /// Source chunks rendered with their metadata headers.
    pub fn formatted_sources(&self) -> Vec<String> {
        format_sources(&self.sources)
    }
}

/// Answers a question, optionally in the context of a rendered chat history.
///
/// `None` selects single-turn QA; `Some(history)` selects the conversational
/// template, even when the history is still empty.
pub trait Answerer: Send + Sync {
    fn answer(&self, query: &str, history: Option<&str>) -> Result<Answer, QaError>;
}

pub struct QaEngine {
    retriever: Retriever,
    generator: Box<dyn Generator>,
    llm: LLMConfig,
    condense_questions: bool,
}

impl QaEngine {
    pub fn new(retriever: Retriever, generator: Box<dyn Generator>, llm: LLMConfig) -> Self {
        QaEngine {
            retriever,
            generator,
            llm,
            condense_questions: true,
        }
    }

    /// Disables rewriting follow-ups into standalone questions before retrieval.
    pub fn without_condensing(mut self) -> Self {
        self.condense_questions = false;
        self
    }

    pub fn generator(&self) -> &dyn Generator {
        self.generator.as_ref()
    }

    fn standalone_question(&self, query: &str, history: &str) -> Result<String, QaError> {
        let prompt = build_condense_prompt(history, query);
        let rewritten = self.generator.generate_with(&prompt, &self.llm)?;
        let rewritten = rewritten.trim();
        debug!(standalone = %preview(rewritten, 80), "condensed follow-up question");
        if rewritten.is_empty() {
            Ok(query.to_string())
        } else {
            Ok(rewritten.to_string())
        }
    }
}

impl Answerer for QaEngine {
    fn answer(&self, query: &str, history: Option<&str>) -> Result<Answer, QaError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(QaError::EmptyQuery);
        }

        let style = match history {
            Some(_) => PromptStyle::Conversational,
            None => PromptStyle::SingleTurn,
        };
        let standalone_question = match history {
            Some(h) if self.condense_questions && !h.is_empty() => {
                Some(self.standalone_question(query, h)?)
            }
            _ => None,
        };

        let search_query = standalone_question.as_deref().unwrap_or(query);
        let sources = self.retriever.retrieve_default(search_query)?;
        let prompt = build_prompt(style, &sources, query, history);
        info!(
            query = %preview(query, 60),
            sources = sources.len(),
            ?style,
            "generating answer"
        );
        let text = self.generator.generate_with(&prompt, &self.llm)?;

        Ok(Answer {
            text: text.trim().to_string(),
            sources,
            standalone_question,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::error::GenerationError;
    use crate::llm::Generator;

    /// Replays canned replies and records every prompt it was sent.
    #[derive(Default)]
    pub struct ScriptedGenerator {
        replies: Mutex<VecDeque<Result<String, GenerationError>>>,
        pub prompts: Mutex<Vec<(String, f32, String)>>,
    }

    impl ScriptedGenerator {
        pub fn replying(replies: &[&str]) -> Self {
            let generator = ScriptedGenerator::default();
            {
                let mut queue = generator.replies.lock().unwrap();
                queue.extend(replies.iter().map(|r| Ok(r.to_string())));
            }
            generator
        }

        pub fn push_failure(&self) {
            self.replies
                .lock()
                .unwrap()
                .push_back(Err(GenerationError::Service {
                    status: 429,
                    body: "rate limited".into(),
                }));
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _, _)| p.clone())
                .collect()
        }
    }

    impl Generator for ScriptedGenerator {
        fn generate(
            &self,
            prompt: &str,
            temperature: f32,
            model: &str,
        ) -> Result<String, GenerationError> {
            self.prompts
                .lock()
                .unwrap()
                .push((prompt.to_string(), temperature, model.to_string()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("I don't know.".to_string()))
        }
    }

    impl Generator for std::sync::Arc<ScriptedGenerator> {
        fn generate(
            &self,
            prompt: &str,
            temperature: f32,
            model: &str,
        ) -> Result<String, GenerationError> {
            self.as_ref().generate(prompt, temperature, model)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::testing::ScriptedGenerator;
    use super::*;
    use crate::chunker::{ChunkConfig, split_documents};
    use crate::embedder::HashingEmbedder;
    use crate::loader::{DocumentRecord, PaperMetadata};
    use crate::vector_db::VectorDB;
    use anyhow::Result;

    fn retriever() -> Result<Retriever> {
        let docs: Vec<DocumentRecord> = [
            ("study_NatureML_2021.pdf", "Anomaly detection via autoencoders."),
            ("graphs_ICLR_2019.pdf", "Message passing graph networks for chemistry."),
        ]
        .iter()
        .map(|(file, text)| DocumentRecord {
            text: text.to_string(),
            page: 0,
            metadata: PaperMetadata::from_file_name(file),
        })
        .collect();
        let embedder = HashingEmbedder::default();
        let db = VectorDB::build(split_documents(&docs, ChunkConfig::default()), &embedder)?;
        Ok(Retriever::new(db, Box::new(embedder), 1))
    }

    fn engine(generator: Arc<ScriptedGenerator>) -> Result<QaEngine> {
        Ok(QaEngine::new(retriever()?, Box::new(generator), LLMConfig::default()))
    }

    #[test]
    fn test_single_turn_answer_with_sources() -> Result<()> {
        let generator = Arc::new(ScriptedGenerator::replying(&["  They use autoencoders.  "]));
        let engine = engine(generator.clone())?;

        let answer = engine.answer("Which anomaly detection method is used?", None)?;
        assert_eq!(answer.text, "They use autoencoders.");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].metadata.year, "2021");
        assert!(answer.formatted_sources()[0].starts_with("## MAIN PAPER METADATA:\nTitle: study_NatureML_2021"));
        assert_eq!(answer.standalone_question, None);

        let prompts = generator.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Source: study_NatureML_2021.pdf"));
        assert!(prompts[0].ends_with("Question: Which anomaly detection method is used?\n"));
        let (_, temperature, model) = generator.prompts.lock().unwrap()[0].clone();
        assert_eq!((temperature, model.as_str()), (0.7, "gpt-3.5-turbo"));
        Ok(())
    }

    #[test]
    fn test_follow_up_is_condensed_before_retrieval() -> Result<()> {
        let generator = Arc::new(ScriptedGenerator::replying(&[
            "Which graph networks are used for chemistry?",
            "Message passing networks.",
        ]));
        let engine = engine(generator.clone())?;

        let history = "Human: Tell me about the ICLR paper\nAI: It is about graphs.\n";
        let answer = engine.answer("what networks?", Some(history))?;
        assert_eq!(
            answer.standalone_question.as_deref(),
            Some("Which graph networks are used for chemistry?")
        );
        assert_eq!(answer.sources[0].metadata.journal, "ICLR");

        let prompts = generator.prompts();
        assert!(prompts[0].starts_with("Given the following conversation"));
        assert!(prompts[1].contains("Chat History:\nHuman: Tell me about the ICLR paper"));
        assert!(prompts[1].ends_with("Question: what networks?\n"));
        Ok(())
    }

    #[test]
    fn test_condensing_can_be_disabled() -> Result<()> {
        let generator = Arc::new(ScriptedGenerator::replying(&["ok"]));
        let engine = engine(generator.clone())?.without_condensing();
        engine.answer("and then?", Some("Human: hi\nAI: hello\n"))?;
        assert_eq!(generator.prompts().len(), 1);
        Ok(())
    }

    #[test]
    fn test_first_conversational_turn_skips_condensing() -> Result<()> {
        let generator = Arc::new(ScriptedGenerator::replying(&["hello!"]));
        let engine = engine(generator.clone())?;
        let answer = engine.answer("hello", Some(""))?;
        assert_eq!(answer.text, "hello!");
        let prompts = generator.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("If asked about the latest paper"));
        Ok(())
    }

    #[test]
    fn test_empty_query_is_rejected() -> Result<()> {
        let engine = engine(Arc::new(ScriptedGenerator::default()))?;
        assert!(matches!(engine.answer("   ", None), Err(QaError::EmptyQuery)));
        Ok(())
    }

    #[test]
    fn test_generation_failure_propagates() -> Result<()> {
        let generator = Arc::new(ScriptedGenerator::default());
        generator.push_failure();
        let engine = engine(generator)?;
        assert!(matches!(engine.answer("autoencoders?", None), Err(QaError::Generation(_))));
        Ok(())
    }
}
