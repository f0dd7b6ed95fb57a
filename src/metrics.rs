//! Token and cost accounting.
//!
//! Usage is accumulated into `execution.total_tokens` and
//! `execution.total_cost_usd` in the same transaction that appends the
//! `tokens_logged` audit event.

use tracing::debug;

use crate::errors::CoreResult;
use crate::state::store::StateStore;

/// One usage report from an agent session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenUsage {
    pub session: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Accumulate a usage report into the execution counters.
///
/// Returns the new running totals `(total_tokens, total_cost_usd)`.
pub fn log_tokens(store: &StateStore, usage: TokenUsage) -> CoreResult<(u64, f64)> {
    store.update(move |doc| {
        doc.execution.total_tokens += usage.total_tokens();
        doc.execution.total_cost_usd += usage.cost_usd;
        let totals = (doc.execution.total_tokens, doc.execution.total_cost_usd);

        doc.append_event(
            "tokens_logged",
            None,
            serde_json::json!({
                "session": usage.session,
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
                "cost_usd": usage.cost_usd,
            }),
        );
        debug!(
            session = %usage.session,
            tokens = usage.total_tokens(),
            "logged token usage"
        );
        Ok(totals)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (StateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.init("/repo").unwrap();
        (store, dir)
    }

    #[test]
    fn test_log_tokens_accumulates() {
        let (store, _dir) = setup();

        let (tokens, cost) = log_tokens(
            &store,
            TokenUsage {
                session: "planner-1".into(),
                input_tokens: 1000,
                output_tokens: 250,
                cost_usd: 0.05,
            },
        )
        .unwrap();
        assert_eq!(tokens, 1250);
        assert!((cost - 0.05).abs() < f64::EPSILON);

        let (tokens, cost) = log_tokens(
            &store,
            TokenUsage {
                session: "worker-T001".into(),
                input_tokens: 400,
                output_tokens: 100,
                cost_usd: 0.02,
            },
        )
        .unwrap();
        assert_eq!(tokens, 1750);
        assert!((cost - 0.07).abs() < 1e-9);

        let doc = store.load().unwrap();
        assert_eq!(doc.execution.total_tokens, 1750);
        let logged: Vec<_> = doc
            .events
            .iter()
            .filter(|e| e.kind == "tokens_logged")
            .collect();
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[1].details["session"], "worker-T001");
    }
}
