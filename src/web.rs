//! Browser front end: one chat page backed by per-session conversations.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Form, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversation::{Conversation, Turn};
use crate::qa::Answerer;

const SESSION_COOKIE: &str = "paperchat_session";
const MAX_SESSIONS: usize = 10_000;

struct Session {
    conversation: Arc<Mutex<Conversation>>,
    last_used: Instant,
}

/// Shared by all sessions. The engine is read-only; each session's
/// conversation sits behind its own lock so one session answers one turn at a time.
///
/// A session is stored on its first submitted question and forgotten once it
/// has been idle for `idle_timeout`.
pub struct AppState {
    engine: Arc<dyn Answerer>,
    sessions: StdMutex<HashMap<Uuid, Session>>,
    history_turns: usize,
    idle_timeout: Duration,
}

impl AppState {
    pub fn new(engine: Arc<dyn Answerer>, history_turns: usize, idle_timeout: Duration) -> Self {
        AppState {
            engine,
            sessions: StdMutex::new(HashMap::new()),
            history_turns,
            idle_timeout,
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The conversation of a known session, if it has not expired.
    fn existing(&self, id: Uuid) -> Option<Arc<Mutex<Conversation>>> {
        let mut sessions = self.sessions();
        let session = sessions.get_mut(&id)?;
        if session.last_used.elapsed() >= self.idle_timeout {
            sessions.remove(&id);
            return None;
        }
        session.last_used = Instant::now();
        Some(session.conversation.clone())
    }

    /// The conversation for `id`, created on first use. Expired sessions are
    /// pruned first; at capacity the least recently used one is dropped.
    fn session(&self, id: Uuid) -> Arc<Mutex<Conversation>> {
        let mut sessions = self.sessions();
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, s| now.duration_since(s.last_used) < self.idle_timeout);
        if sessions.len() < before {
            debug!(expired = before - sessions.len(), "pruned idle sessions");
        }
        if !sessions.contains_key(&id) && sessions.len() >= MAX_SESSIONS {
            if let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(key, _)| *key)
            {
                sessions.remove(&oldest);
            }
        }

        let history_turns = self.history_turns;
        let session = sessions.entry(id).or_insert_with(|| Session {
            conversation: Arc::new(Mutex::new(Conversation::new(history_turns))),
            last_used: now,
        });
        session.last_used = now;
        session.conversation.clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatForm {
    prompt: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(show_chat).post(submit_message))
        .with_state(state)
}

pub async fn serve<F>(addr: SocketAddr, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "chat page listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server failed")?;
    Ok(())
}

/// Runs the chat page on its own runtime until `shutdown` resolves.
///
/// The engine owns blocking HTTP clients, which must not be dropped inside
/// an async context: `state` is declared before `runtime`, so the runtime
/// shuts down first and the engine is released afterwards.
pub fn run<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(state);
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(serve(addr, state.clone(), shutdown))
}

async fn show_chat(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let (id, fresh) = session_id(&headers);
    let turns = match state.existing(id) {
        Some(convo) => convo.lock().await.turns().to_vec(),
        None => Vec::new(),
    };
    page_response(id, fresh, render_page(&turns, None))
}

async fn submit_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<ChatForm>,
) -> Response {
    let prompt = form.prompt.trim().to_string();
    if prompt.is_empty() {
        return show_chat(State(state), headers).await;
    }
    let (id, fresh) = session_id(&headers);
    let mut guard = state.session(id).lock_owned().await;

    let engine = state.engine.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let result = guard.ask(engine.as_ref(), &prompt).map(|_| ());
        (guard, result)
    })
    .await;
    match joined {
        Ok((guard, result)) => {
            let error = result.err().map(|e| {
                warn!(session = %id, error = %e, "turn failed");
                format!("Sorry, I couldn't answer that: {e}")
            });
            page_response(id, fresh, render_page(guard.turns(), error.as_deref()))
        }
        Err(e) => {
            warn!(session = %id, error = %e, "answer task panicked");
            page_response(id, fresh, render_page(&[], Some("Internal error; please reload.")))
        }
    }
}

fn session_id(headers: &HeaderMap) -> (Uuid, bool) {
    let existing = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| Uuid::parse_str(value).ok());
    match existing {
        Some(id) => (id, false),
        None => (Uuid::new_v4(), true),
    }
}

fn page_response(id: Uuid, set_cookie: bool, body: String) -> Response {
    let mut response = Html(body).into_response();
    if set_cookie {
        let cookie = format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax");
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_page(turns: &[Turn], error: Option<&str>) -> String {
    let mut messages = String::new();
    for turn in turns {
        for (role, content) in [("user", &turn.question), ("assistant", &turn.answer)] {
            messages.push_str(&format!(
                "<div class=\"msg {role}\"><b>{role}</b><p>{}</p></div>\n",
                escape_html(content)
            ));
        }
    }
    if let Some(error) = error {
        messages.push_str(&format!(
            "<div class=\"msg error\"><p>{}</p></div>\n",
            escape_html(error)
        ));
    }

    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Research Publications Chatbot</title>
<style>
body {{ font-family: sans-serif; max-width: 48rem; margin: 2rem auto; }}
.msg {{ padding: .5rem 1rem; margin: .5rem 0; border-radius: .5rem; white-space: pre-wrap; }}
.user {{ background: #eef; }}
.assistant {{ background: #efe; }}
.error {{ background: #fee; }}
form {{ display: flex; gap: .5rem; }}
input {{ flex: 1; padding: .5rem; }}
</style>
</head>
<body>
<h1>Research Publications Chatbot</h1>
{messages}<form method="post" action="/">
<input name="prompt" placeholder="Ask about my research" autofocus>
<button type="submit">Send</button>
</form>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GenerationError, QaError};
    use crate::qa::Answer;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Parrot;

    impl Answerer for Parrot {
        fn answer(&self, query: &str, history: Option<&str>) -> Result<Answer, QaError> {
            if query == "timeout" {
                return Err(GenerationError::InvalidResponse("timed out".into()).into());
            }
            Ok(Answer {
                text: format!("{} <turns before>", history.unwrap_or_default().lines().count() / 2),
                sources: Vec::new(),
                standalone_question: None,
            })
        }
    }

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Arc::new(Parrot), 0, Duration::from_secs(3600)))
    }

    fn session_count(state: &AppState) -> usize {
        state.sessions().len()
    }

    fn cookie(id: Uuid) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!("theme=dark; {SESSION_COOKIE}={id}");
        headers.insert(header::COOKIE, HeaderValue::from_str(&value).unwrap());
        headers
    }

    async fn body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn form(prompt: &str) -> Form<ChatForm> {
        Form(ChatForm {
            prompt: prompt.to_string(),
        })
    }

    #[test]
    fn test_session_cookie_parsing() {
        let id = Uuid::new_v4();
        assert_eq!(session_id(&cookie(id)), (id, false));
        let (_, fresh) = session_id(&HeaderMap::new());
        assert!(fresh);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>\"x\" & 'y'</b>"), "&lt;b&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/b&gt;");
    }

    #[tokio::test]
    async fn test_new_visitor_gets_cookie() {
        let response = show_chat(State(state()), HeaderMap::new()).await;
        let set_cookie = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.starts_with("paperchat_session="));
        assert!(body(response).await.contains("Research Publications Chatbot"));
    }

    #[tokio::test]
    async fn test_turns_accumulate_per_session() {
        let state = state();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        submit_message(State(state.clone()), cookie(alice), form("first")).await;
        let page = body(submit_message(State(state.clone()), cookie(alice), form("second <b>")).await).await;
        assert!(page.contains("second &lt;b&gt;"));
        assert!(page.contains("1 &lt;turns before&gt;"));
        assert!(page.find("first").unwrap() < page.find("second").unwrap());

        let other = body(show_chat(State(state.clone()), cookie(bob)).await).await;
        assert!(!other.contains("first"));
    }

    #[tokio::test]
    async fn test_failed_turn_shows_error_and_is_not_recorded() {
        let state = state();
        let id = Uuid::new_v4();
        let page = body(submit_message(State(state.clone()), cookie(id), form("timeout")).await).await;
        assert!(page.contains("Sorry, I couldn&#39;t answer that"));

        let page = body(show_chat(State(state), cookie(id)).await).await;
        assert!(!page.contains("timeout"));
    }

    #[tokio::test]
    async fn test_anonymous_visits_store_no_session() {
        let state = state();
        for _ in 0..1000 {
            show_chat(State(state.clone()), HeaderMap::new()).await;
        }
        submit_message(State(state.clone()), HeaderMap::new(), form("   ")).await;
        assert_eq!(session_count(&state), 0);

        submit_message(State(state.clone()), HeaderMap::new(), form("hello")).await;
        assert_eq!(session_count(&state), 1);
    }

    #[tokio::test]
    async fn test_idle_sessions_are_forgotten() {
        let state = Arc::new(AppState::new(Arc::new(Parrot), 0, Duration::ZERO));
        let alice = Uuid::new_v4();
        submit_message(State(state.clone()), cookie(alice), form("first")).await;
        submit_message(State(state.clone()), cookie(Uuid::new_v4()), form("other")).await;
        assert_eq!(session_count(&state), 1);

        let page = body(show_chat(State(state.clone()), cookie(alice)).await).await;
        assert!(!page.contains("first"));
    }

    struct DropWatch {
        dropped_in_runtime: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl Answerer for DropWatch {
        fn answer(&self, query: &str, history: Option<&str>) -> Result<Answer, QaError> {
            Parrot.answer(query, history)
        }
    }

    impl Drop for DropWatch {
        fn drop(&mut self) {
            let in_runtime = tokio::runtime::Handle::try_current().is_ok();
            self.dropped_in_runtime.store(in_runtime, Ordering::SeqCst);
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_engine_released_outside_runtime() -> anyhow::Result<()> {
        let dropped_in_runtime = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicBool::new(false));
        let engine = Arc::new(DropWatch {
            dropped_in_runtime: dropped_in_runtime.clone(),
            dropped: dropped.clone(),
        });
        let state = AppState::new(engine, 0, Duration::from_secs(60));

        run("127.0.0.1:0".parse()?, state, async {})?;

        assert!(dropped.load(Ordering::SeqCst));
        assert!(!dropped_in_runtime.load(Ordering::SeqCst));
        Ok(())
    }
}
