//! LLM-graded evaluation of the single-turn QA path.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::llm::{Generator, LLMConfig};
use crate::qa::Answerer;

const GRADING_TEMPLATE: &str = "You are a teacher grading a quiz.
You are given a question, the student's answer, and the true answer, and are asked to score the student answer as either CORRECT or INCORRECT.

Example Format:
QUESTION: question here
STUDENT ANSWER: student's answer here
TRUE ANSWER: true answer here
GRADE: CORRECT or INCORRECT here

Grade the student answers based ONLY on their factual accuracy. Ignore differences in punctuation and phrasing between the student answer and true answer. It is OK if the student answer contains more information than the true answer, as long as it does not contain any conflicting statements. Begin!

";

/// A question with its reference answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub query: String,
    pub answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Grade {
    Correct,
    Incorrect,
    /// The grader's reply named neither grade.
    Unparsed,
}

impl Grade {
    /// Reads the verdict from grader output such as `GRADE: CORRECT`.
    pub fn parse(text: &str) -> Self {
        let upper = text.to_uppercase();
        let verdict = upper.rsplit("GRADE:").next().unwrap_or(&upper);
        if verdict.contains("INCORRECT") {
            Grade::Incorrect
        } else if verdict.contains("CORRECT") {
            Grade::Correct
        } else {
            Grade::Unparsed
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GradedExample {
    pub query: String,
    pub reference: String,
    pub prediction: Option<String>,
    /// Raw grader text, or the error that prevented grading.
    pub feedback: String,
    pub grade: Grade,
}

pub fn default_examples() -> Vec<Example> {
    vec![Example {
        query: "What is the anomaly detection method used in the paper?".to_string(),
        answer: "The answer should discuss autoencoder model used for anomaly detection in the paper"
            .to_string(),
    }]
}

/// Loads examples from a JSON array of `{"query": ..., "answer": ...}` objects.
pub fn load_examples(path: &Path) -> Result<Vec<Example>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read examples from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid examples file {}", path.display()))
}

pub fn grading_prompt(example: &Example, prediction: &str) -> String {
    format!(
        "{GRADING_TEMPLATE}QUESTION: {}\nSTUDENT ANSWER: {}\nTRUE ANSWER: {}\nGRADE:",
        example.query, prediction, example.answer
    )
}

/// Answers every example with the single-turn path and has `grader` judge it.
/// A failure on one example is recorded in its feedback and does not stop the run.
pub fn evaluate<A: Answerer + ?Sized>(
    engine: &A,
    grader: &dyn Generator,
    grader_config: &LLMConfig,
    examples: &[Example],
) -> Vec<GradedExample> {
    examples
        .iter()
        .map(|example| {
            let prediction = match engine.answer(&example.query, None) {
                Ok(answer) => answer.text,
                Err(e) => {
                    warn!(query = %example.query, error = %e, "prediction failed");
                    return GradedExample {
                        query: example.query.clone(),
                        reference: example.answer.clone(),
                        prediction: None,
                        feedback: format!("prediction failed: {e}"),
                        grade: Grade::Unparsed,
                    };
                }
            };
            let (feedback, grade) =
                match grader.generate_with(&grading_prompt(example, &prediction), grader_config) {
                    Ok(text) => {
                        let text = text.trim().to_string();
                        let grade = Grade::parse(&text);
                        (text, grade)
                    }
                    Err(e) => (format!("grading failed: {e}"), Grade::Unparsed),
                };
            GradedExample {
                query: example.query.clone(),
                reference: example.answer.clone(),
                prediction: Some(prediction),
                feedback,
                grade,
            }
        })
        .collect()
}

/// Prints per-example feedback followed by a tally.
pub fn report<W: Write>(results: &[GradedExample], mut out: W) -> std::io::Result<()> {
    for (i, result) in results.iter().enumerate() {
        writeln!(out, "Example {i}: {}", result.query)?;
        if let Some(prediction) = &result.prediction {
            writeln!(out, "  Prediction: {prediction}")?;
        }
        writeln!(out, "  Feedback: {}", result.feedback)?;
        writeln!(out, "  Grade: {:?}", result.grade)?;
    }
    let correct = results.iter().filter(|r| r.grade == Grade::Correct).count();
    writeln!(out, "\n{correct}/{} graded CORRECT", results.len())?;
    info!(correct, total = results.len(), "evaluation finished");
    Ok(())
}
