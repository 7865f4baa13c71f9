/// MCP Tool handlers for NanGuide.
///
/// 1. ask               – answer a tourism question (or defer)
/// 2. list_unanswered   – deferred queries and their status
/// 3. list_proposals    – researched answers awaiting or past review
/// 4. approve_proposal  – approve (optionally edit) a pending proposal
/// 5. reject_proposal   – reject a pending proposal
/// 6. run_research      – trigger one research run
/// 7. run_ingestion     – trigger one ingestion run
/// 8. delete_document   – remove a document from the index
/// 9. index_knowledge   – bulk load a JSON Lines knowledge file
use crate::app::App;
use crate::db::models::{ProposalStatus, UnansweredStatus};
use crate::db::search::SearchFilter;
use crate::error::RagError;
use crate::knowledge;
use rmcp::handler::server::ServerHandler;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{ErrorData as McpError, handler::server::tool::ToolRouter, model::*, tool, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::Path;
use tracing::error;

// ── Parameter structs ────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct AskParams {
    /// The traveller's question, in Thai or English
    query: String,
    /// Only search documents from this district (e.g. 'ปัว')
    district: Option<String>,
    /// Only search documents in this category
    category: Option<String>,
    /// Exclude documents in these categories
    exclude_categories: Option<Vec<String>>,
}

#[derive(Deserialize, JsonSchema)]
struct StatusParam {
    /// Status filter; omit for all
    status: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
struct ApproveParams {
    /// Proposal id
    id: i64,
    /// Replacement answer text to store instead of the draft
    answer: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
struct IdParam {
    /// Proposal id
    id: i64,
}

#[derive(Deserialize, JsonSchema)]
struct DocumentParam {
    /// Document key
    id: String,
}

#[derive(Deserialize, JsonSchema)]
struct KnowledgeParams {
    /// Path to a JSON Lines knowledge file
    filepath: String,
}

// ── Response helpers ─────────────────────────────────────────────────

fn json_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(&value).unwrap_or_default(),
    )]))
}

fn error_result(msg: &str) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.to_string())]))
}

fn internal(e: RagError) -> McpError {
    McpError::internal_error(e.to_string(), None)
}

/// Map review-side errors to tool errors the reviewer can act on.
fn review_error(e: RagError) -> Result<CallToolResult, McpError> {
    match e {
        RagError::InvalidTransition { .. } | RagError::NotFound(_) => error_result(&e.to_string()),
        other => Err(internal(other)),
    }
}

fn parse_status<T: std::str::FromStr>(raw: Option<&str>) -> Result<Option<T>, String> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s.parse().map(Some).map_err(|_| format!("unknown status: {s}")),
    }
}

// ── Tool implementations ─────────────────────────────────────────────

#[derive(Clone)]
pub struct AppTools {
    pub app: App,
    pub tool_router: ToolRouter<Self>,
}

impl ServerHandler for AppTools {}

#[tool_router]
impl AppTools {
    pub fn new(app: App) -> Self {
        Self {
            app,
            tool_router: Self::tool_router(),
        }
    }

    // ── Tool 1: ask ─────────────────────────────────────────────────

    #[tool(
        description = "Answer a question about Nan province tourism from the knowledge base. When the knowledge base is not confident the answer is deferred (deferred: true) and the question is queued for research."
    )]
    async fn ask(&self, params: Parameters<AskParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        if p.query.trim().is_empty() {
            return error_result("query is required");
        }

        let mut filter = SearchFilter::default();
        if let Some(d) = p.district {
            filter = filter.must("district", d);
        }
        if let Some(c) = p.category {
            filter = filter.must("category", c);
        }
        for c in p.exclude_categories.unwrap_or_default() {
            filter = filter.must_not("category", c);
        }

        let orchestrator = &self.app.orchestrator;
        let timeout = self.app.config.answer_timeout();
        let result = if filter.is_empty() {
            self.app.ask(&p.query).await
        } else {
            tokio::time::timeout(timeout, orchestrator.answer_filtered(&p.query, Some(&filter)))
                .await
                .unwrap_or(Err(RagError::Timeout(timeout)))
        };

        match result {
            Ok(answer) => json_result(serde_json::json!(answer)),
            Err(e) if e.is_request_failure() => {
                error!(error = %e, "Request failed");
                json_result(serde_json::json!({
                    "text": self.app.apology(),
                    "failed": true,
                }))
            }
            Err(e) => Err(internal(e)),
        }
    }

    // ── Tool 2: list_unanswered ─────────────────────────────────────

    #[tool(description = "List deferred questions. Status: OPEN | RESEARCHING | RESOLVED")]
    async fn list_unanswered(&self, params: Parameters<StatusParam>) -> Result<CallToolResult, McpError> {
        let status = match parse_status::<UnansweredStatus>(params.0.status.as_deref()) {
            Ok(s) => s,
            Err(msg) => return error_result(&msg),
        };
        let entries = self.app.log.list(status).await.map_err(internal)?;
        json_result(serde_json::json!({ "count": entries.len(), "entries": entries }))
    }

    // ── Tool 3: list_proposals ──────────────────────────────────────

    #[tool(description = "List researched answer proposals. Status: PENDING | APPROVED | REJECTED | INGESTED")]
    async fn list_proposals(&self, params: Parameters<StatusParam>) -> Result<CallToolResult, McpError> {
        let status = match parse_status::<ProposalStatus>(params.0.status.as_deref()) {
            Ok(s) => s,
            Err(msg) => return error_result(&msg),
        };
        let proposals = self.app.approvals.list(status).await.map_err(internal)?;
        json_result(serde_json::json!({ "count": proposals.len(), "proposals": proposals }))
    }

    // ── Tool 4: approve_proposal ────────────────────────────────────

    #[tool(description = "Approve a PENDING proposal so the next ingestion run adds it to the knowledge base. Optionally replace its answer text first.")]
    async fn approve_proposal(&self, params: Parameters<ApproveParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        if let Some(answer) = p.answer.as_deref().filter(|a| !a.trim().is_empty()) {
            if let Err(e) = self.app.approvals.revise(p.id, answer).await {
                return review_error(e);
            }
        }
        match self.app.approvals.approve(p.id).await {
            Ok(proposal) => json_result(serde_json::json!({ "proposal": proposal })),
            Err(e) => review_error(e),
        }
    }

    // ── Tool 5: reject_proposal ─────────────────────────────────────

    #[tool(description = "Reject a PENDING proposal")]
    async fn reject_proposal(&self, params: Parameters<IdParam>) -> Result<CallToolResult, McpError> {
        match self.app.approvals.reject(params.0.id).await {
            Ok(proposal) => json_result(serde_json::json!({ "proposal": proposal })),
            Err(e) => review_error(e),
        }
    }

    // ── Tool 6: run_research ────────────────────────────────────────

    #[tool(description = "Research all OPEN deferred questions now and create proposals")]
    async fn run_research(&self) -> Result<CallToolResult, McpError> {
        match self.app.researcher.run_once().await.map_err(internal)? {
            Some(report) => json_result(serde_json::json!({ "report": report })),
            None => json_result(serde_json::json!({ "skipped": "a research run is already in progress" })),
        }
    }

    // ── Tool 7: run_ingestion ───────────────────────────────────────

    #[tool(description = "Ingest all APPROVED proposals into the knowledge base now")]
    async fn run_ingestion(&self) -> Result<CallToolResult, McpError> {
        match self.app.ingestion.run_once().await.map_err(internal)? {
            Some(report) => json_result(serde_json::json!({ "report": report })),
            None => json_result(serde_json::json!({ "skipped": "an ingestion run is already in progress" })),
        }
    }

    // ── Tool 8: delete_document ─────────────────────────────────────

    #[tool(description = "Delete a document from the knowledge base by key")]
    async fn delete_document(&self, params: Parameters<DocumentParam>) -> Result<CallToolResult, McpError> {
        let id = params.0.id;
        if id.is_empty() {
            return error_result("id is required");
        }
        let deleted = self.app.index.delete(&id).await.map_err(internal)?;
        json_result(serde_json::json!({ "id": id, "deleted": deleted }))
    }

    // ── Tool 9: index_knowledge ─────────────────────────────────────

    #[tool(description = "Index a JSON Lines knowledge file (one place per line, keyed by id or slug)")]
    async fn index_knowledge(&self, params: Parameters<KnowledgeParams>) -> Result<CallToolResult, McpError> {
        let filepath = params.0.filepath;
        let path = Path::new(&filepath);
        if !path.exists() {
            return error_result(&format!("file not found: {filepath}"));
        }

        let (records, malformed) = match knowledge::load_jsonl(path) {
            Ok(loaded) => loaded,
            Err(e) => return error_result(&format!("{e:#}")),
        };
        let report = knowledge::index_records(&self.app.index, self.app.embedder.clone(), &records, false)
            .await
            .map_err(internal)?;

        json_result(serde_json::json!({
            "filepath": filepath,
            "indexed": report.indexed,
            "skipped": report.skipped,
            "malformed": malformed,
        }))
    }

    // ── Tool 10: index_status ───────────────────────────────────────

    #[tool(description = "Show the embedding space the knowledge base is pinned to and its document count")]
    async fn index_status(&self) -> Result<CallToolResult, McpError> {
        let documents = self.app.index.count().await.map_err(internal)?;
        json_result(serde_json::json!({
            "collection": self.app.index.fingerprint(),
            "documents": documents,
        }))
    }
}
