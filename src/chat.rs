//! Terminal front ends: the conversational loop and one-shot questions.

use std::io::{self, BufRead, Write};

use tracing::{debug, warn};

use crate::conversation::{Conversation, ConversationState};
use crate::qa::Answerer;

/// Reads questions from `input` until EOF or `exit` (any case), answering
/// each against the running conversation. Failed turns are reported and the
/// loop carries on.
pub fn chat_interface<A, R, W>(
    engine: &A,
    conversation: &mut Conversation,
    input: R,
    mut out: W,
) -> io::Result<()>
where
    A: Answerer + ?Sized,
    R: BufRead,
    W: Write,
{
    writeln!(out, "Research Publications Chatbot (type 'exit' to end)")?;
    writeln!(out, "--------------------------------------------------")?;

    let mut lines = input.lines();
    loop {
        write!(out, "\nYour question: ")?;
        out.flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let query = match line {
            Ok(query) => query,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(error = %e, "skipping unreadable input line");
                writeln!(out, "\nChatbot: Sorry, I couldn't read that line. Please try again.")?;
                continue;
            }
            Err(e) => return Err(e),
        };
        let query = query.trim();
        if query.eq_ignore_ascii_case("exit") {
            break;
        }
        if query.is_empty() {
            continue;
        }

        match conversation.ask(engine, query) {
            Ok(answer) => {
                if let Some(standalone) = &answer.standalone_question {
                    debug!(%standalone, "follow-up rewritten for retrieval");
                }
                writeln!(out, "\nChatbot: {}", answer.text)?;
            }
            Err(e) => {
                warn!(error = %e, "turn failed");
                writeln!(out, "\nChatbot: Sorry, I couldn't answer that ({e}). Please try again.")?;
            }
        }
    }

    if conversation.state() == ConversationState::Idle {
        debug!("session ended before any successful turn");
    }
    Ok(())
}

/// Answers one question without history, optionally listing its sources.
pub fn ask_once<A, W>(engine: &A, query: &str, show_sources: bool, mut out: W) -> anyhow::Result<()>
where
    A: Answerer + ?Sized,
    W: Write,
{
    let answer = engine.answer(query, None)?;
    writeln!(out, "{}", answer.text)?;
    if show_sources {
        for (i, source) in answer.formatted_sources().iter().enumerate() {
            writeln!(out, "\n--- Source {} ---\n{}", i + 1, source)?;
        }
    }
    Ok(())
}
