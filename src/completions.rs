use async_trait::async_trait;

/// Token usage reported by the provider once a completion finishes. The
/// entitlement core only consumes the count.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub output: String,
    pub tokens_consumed: i64,
}

/// key: completion-executor -> provider integration
#[async_trait]
pub trait CompletionExecutor: Send + Sync {
    async fn execute(
        &self,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> anyhow::Result<CompletionOutcome>;
}

/// key: completion-executor-stub -> deterministic stand-in
pub struct StubCompletionExecutor;

#[async_trait]
impl CompletionExecutor for StubCompletionExecutor {
    async fn execute(
        &self,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> anyhow::Result<CompletionOutcome> {
        // 4 chars per token mirrors the usual tokenizer rule of thumb
        let tokens_consumed = (prompt.len() as i64 / 4).max(1);
        Ok(CompletionOutcome {
            output: format!("[{provider}/{model}] {prompt}"),
            tokens_consumed,
        })
    }
}
