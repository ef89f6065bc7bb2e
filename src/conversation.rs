use serde::Serialize;

use crate::error::QaError;
use crate::qa::{Answer, Answerer};

/// One question/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// No successful turn yet.
    Idle,
    Active,
}

/// Session transcript plus the policy for how much of it reaches the prompt.
///
/// The transcript only grows, in insertion order. Prompts see the last
/// `history_turns` turns (all of them when `history_turns` is zero).
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
    history_turns: usize,
}

impl Conversation {
    pub fn new(history_turns: usize) -> Self {
        Conversation {
            turns: Vec::new(),
            history_turns,
        }
    }

    pub fn state(&self) -> ConversationState {
        if self.turns.is_empty() {
            ConversationState::Idle
        } else {
            ConversationState::Active
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Renders the prompt window as alternating `Human:` / `AI:` lines, oldest first.
    pub fn history_text(&self) -> String {
        let skip = match self.history_turns {
            0 => 0,
            window => self.turns.len().saturating_sub(window),
        };
        let mut history = String::new();
        for turn in &self.turns[skip..] {
            history.push_str("Human: ");
            history.push_str(&turn.question);
            history.push_str("\nAI: ");
            history.push_str(&turn.answer);
            history.push('\n');
        }
        history
    }

    /// Answers `query` with the current history; the turn is recorded only on success.
    pub fn ask<A: Answerer + ?Sized>(&mut self, engine: &A, query: &str) -> Result<Answer, QaError> {
        let history = self.history_text();
        let answer = engine.answer(query, Some(&history))?;
        self.turns.push(Turn {
            question: query.trim().to_string(),
            answer: answer.text.clone(),
        });
        Ok(answer)
    }
}
