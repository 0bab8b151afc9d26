//! Question-answering HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Answer `{question, format}` from hybrid retrieval |
//! | `GET`  | `/health` | Static readiness payload with the model name |
//!
//! `format` is `"markdown"` (default) or `"json"`. A markdown answer comes back
//! as `{ "answer": "...", "html": "..." }`. A JSON answer that parses comes
//! back as `{ "answer": <parsed value> }`; one that does not parse falls back
//! to the markdown shape.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `upstream_error` (502).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser front end
//! can call the API from anywhere.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pulldown_cmark::{html, Options, Parser};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tower_http::cors::{Any, CorsLayer};

use aem_rag_core::merge::format_context;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::llm::{build_prompt, create_generator, AnswerGenerator};
use crate::retrieve::HybridRetriever;

/// Output shape requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AnswerFormat {
    Markdown,
    Json,
}

impl AnswerFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Some(Self::Markdown),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub retriever: Arc<HybridRetriever>,
    pub generator: Arc<dyn AnswerGenerator>,
}

/// Retrieve context for `question` and generate an answer from it.
pub async fn answer_question(
    retriever: &HybridRetriever,
    generator: &dyn AnswerGenerator,
    question: &str,
    format: AnswerFormat,
) -> anyhow::Result<String> {
    let docs = retriever.retrieve(question).await;
    tracing::debug!(question, docs = docs.len(), "retrieved context");
    let context = format_context(&docs);
    let prompt = build_prompt(question, &context, format == AnswerFormat::Json);
    generator.generate(&prompt).await
}

/// Shape a raw model answer into the response body.
pub fn render_answer(answer: &str, format: AnswerFormat) -> serde_json::Value {
    if format == AnswerFormat::Json {
        match serde_json::from_str::<serde_json::Value>(answer) {
            Ok(parsed) => return serde_json::json!({ "answer": parsed }),
            Err(e) => tracing::debug!(error = %e, "answer is not valid JSON; returning text"),
        }
    }
    serde_json::json!({
        "answer": answer,
        "html": markdown_to_html(answer),
    })
}

/// Render markdown (with tables) to HTML.
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(markdown, options);
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Bind to `bind` and serve until the process is terminated.
pub async fn run_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind, "listening");
    println!("Listening on http://{}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn upstream_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream_error".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model: String,
    version: &'static str,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.generator.model_name().to_string(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    format: Option<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(req) = payload.map_err(|e| bad_request(e.body_text()))?;

    let question = req.question.as_deref().map(str::trim).unwrap_or_default();
    if question.is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let format = match req.format.as_deref() {
        None => AnswerFormat::Markdown,
        Some(f) => AnswerFormat::parse(f)
            .ok_or_else(|| bad_request(format!("unknown format '{}': use markdown or json", f)))?,
    };

    let answer = answer_question(&state.retriever, state.generator.as_ref(), question, format)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "answer generation failed");
            upstream_error(format!("answer generation failed: {}", e))
        })?;

    Ok(Json(render_answer(&answer, format)))
}

/// Build the retriever and generator from configuration.
///
/// Resolves the credential once for both providers.
pub async fn open_state(config: &Config) -> anyhow::Result<AppState> {
    let credential = config.resolve_credential(true, true)?;
    let embedder = create_embedder(&config.embedding, credential.clone())?;
    let generator = create_generator(&config.llm, credential)?;
    let retriever = HybridRetriever::open(config, embedder).await?;
    Ok(AppState {
        retriever: Arc::new(retriever),
        generator,
    })
}

/// `aemrag serve`: start the HTTP server on `[server].bind`.
pub async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let state = open_state(config).await?;
    run_server(&config.server.bind, state).await
}

/// `aemrag ask`: answer one question, or read questions from stdin.
pub async fn run_ask(
    config: &Config,
    question: Option<String>,
    format: AnswerFormat,
) -> anyhow::Result<()> {
    let state = open_state(config).await?;

    if let Some(question) = question {
        if question.trim().is_empty() {
            anyhow::bail!("question must not be empty");
        }
        let answer =
            answer_question(&state.retriever, state.generator.as_ref(), &question, format).await?;
        print_answer(&answer, format)?;
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("Ask about AEM content (or 'exit'): ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question.to_lowercase().as_str(), "exit" | "quit") {
            break;
        }
        match answer_question(&state.retriever, state.generator.as_ref(), question, format).await
        {
            Ok(answer) => print_answer(&answer, format)?,
            Err(e) => eprintln!("error: {:#}", e),
        }
    }
    Ok(())
}

fn print_answer(answer: &str, format: AnswerFormat) -> anyhow::Result<()> {
    match format {
        AnswerFormat::Markdown => println!("{}", answer),
        AnswerFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&render_answer(answer, format))?)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Embedder;
    use crate::retrieve::{DenseRetriever, SparseRetriever};
    use aem_rag_core::models::FlatRecord;
    use aem_rag_core::vector_index::FlatIndex;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct UnitEmbedder;

    #[async_trait]
    impl Embedder for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit"
        }
        fn dims(&self) -> Option<usize> {
            Some(2)
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Replies with a fixed answer and remembers the prompt it was given.
    struct CannedGenerator {
        reply: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AnswerGenerator for CannedGenerator {
        fn model_name(&self) -> &str {
            "canned"
        }
        async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply
                .clone()
                .ok_or_else(|| anyhow::anyhow!("model unavailable"))
        }
    }

    async fn serve(reply: Option<&str>) -> (String, Arc<CannedGenerator>) {
        let records = vec![
            FlatRecord::new("/content/home", "jcr:title: Home", None),
            FlatRecord::new("/content/about", "jcr:title: About us", None),
        ];
        let mut index = FlatIndex::new(2);
        index.add(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let dense = DenseRetriever::new(Arc::new(UnitEmbedder), index, records.clone(), 1);
        let sparse = SparseRetriever::build(records, 1).await.unwrap();

        let generator = Arc::new(CannedGenerator {
            reply: reply.map(str::to_string),
            prompts: Mutex::new(Vec::new()),
        });
        let state = AppState {
            retriever: Arc::new(HybridRetriever::new(dense, Some(sparse))),
            generator: generator.clone(),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{}", addr), generator)
    }

    #[test]
    fn markdown_tables_render() {
        let html = markdown_to_html("| Name | Path |\n|---|---|\n| hero | /c/h |\n");
        assert!(html.contains("<table>"));
        assert!(html.contains("<td>hero</td>"));
    }

    #[test]
    fn json_answers_parse_or_fall_back() {
        let parsed = render_answer(r#"[{"name": "hero"}]"#, AnswerFormat::Json);
        assert_eq!(parsed, json!({"answer": [{"name": "hero"}]}));

        let fallback = render_answer("```json\n[]\n```", AnswerFormat::Json);
        assert_eq!(fallback["answer"], "```json\n[]\n```");
        assert!(fallback["html"].as_str().unwrap().contains("<code"));
    }

    #[test]
    fn format_names() {
        assert_eq!(AnswerFormat::parse("JSON"), Some(AnswerFormat::Json));
        assert_eq!(AnswerFormat::parse("markdown"), Some(AnswerFormat::Markdown));
        assert_eq!(AnswerFormat::parse("xml"), None);
    }

    #[tokio::test]
    async fn query_uses_dense_then_sparse_context() {
        let (base, generator) = serve(Some("**Home**")).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/query", base))
            .json(&json!({"question": "about us"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["answer"], "**Home**");
        assert!(body["html"].as_str().unwrap().contains("<strong>Home</strong>"));

        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("jcr:title: Home\n\njcr:title: About us"));
    }

    #[tokio::test]
    async fn empty_question_is_bad_request() {
        let (base, generator) = serve(Some("x")).await;
        let client = reqwest::Client::new();
        for body in [json!({"question": "   "}), json!({}), json!({"format": "json"})] {
            let resp = client
                .post(format!("{}/query", base))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 400);
            let err: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(err["error"]["code"], "bad_request");
        }

        let resp = client
            .post(format!("{}/query", base))
            .json(&json!({"question": "q", "format": "xml"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(generator.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn generation_failure_is_bad_gateway() {
        let (base, _) = serve(None).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/query", base))
            .json(&json!({"question": "home"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let err: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(err["error"]["code"], "upstream_error");
    }

    #[tokio::test]
    async fn health_reports_model() {
        let (base, _) = serve(Some("x")).await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["model"], "canned");
    }
}
