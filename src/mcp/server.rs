/// MCP Server setup using `rmcp` with stdio transport.
///
/// The MCP client is the chat and review front end: it asks questions and
/// approves or rejects proposals.
use crate::app::App;
use crate::mcp::tools::AppTools;
use anyhow::{Context, Result};
use rmcp::{ServiceExt, handler::server::router::Router, transport::io::stdio};
use tracing::info;

/// MCP Server wrapping the application and serving via stdio.
#[derive(Clone)]
pub struct McpServer {
    pub app: App,
}

impl McpServer {
    pub fn new(app: App) -> Self {
        Self { app }
    }

    /// Start the MCP server on stdio transport (blocks until the client disconnects).
    pub async fn start(self) -> Result<()> {
        info!("Starting MCP server on stdio...");
        let (stdin, stdout) = stdio();

        let app_tools = AppTools::new(self.app.clone());
        let router = Router::new(app_tools.clone()).with_tools(app_tools.tool_router.clone());

        let service = router
            .serve((stdin, stdout))
            .await
            .context("MCP Server failed to start on stdio transport")?;
        service
            .waiting()
            .await
            .context("MCP Server encountered an error during stdio transport")?;

        // Let deferred queries reach the log before exiting
        self.app.orchestrator.wait_for_background().await;
        Ok(())
    }
}
