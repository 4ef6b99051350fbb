//! System-wide defaults and fixed text shared across modules.

/// Poll interval used when the configuration does not override it.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;

/// Per-task execution timeout when neither skill nor agent sets one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Isolation profile applied when no other layer resolves one.
pub const DEFAULT_ISOLATION: &str = "standard";

/// Context window assumed for agents whose record does not carry one.
pub const FALLBACK_CONTEXT_WINDOW: i64 = 200_000;

/// Characters reserved for prompt scaffolding when computing the budget.
pub const PROMPT_OVERHEAD_MARGIN: i64 = 1000;

/// Thread entry summaries keep at most this many bytes of agent output.
pub const SUMMARY_MAX_BYTES: usize = 200;

/// Health probe results are served from cache while younger than this.
pub const HEALTH_CACHE_TTL_SECS: u64 = 60;

/// Retry backoff is capped at five minutes regardless of retry count.
pub const RETRY_BACKOFF_CAP_SECS: u64 = 300;

/// Schedule directive delays are clamped to 24 hours.
pub const MAX_DIRECTIVE_DELAY_SECS: u64 = 86_400;

/// Cron `next` gives up after scanning roughly four years of minutes.
pub const CRON_SEARCH_HORIZON_MINUTES: i64 = 4 * 366 * 24 * 60;

/// Retries applied to tasks that do not specify their own ceiling.
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// Default task listing page size on the control surface.
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Memory documents synchronized between machines use this extension.
pub const MEMORY_FILE_EXTENSION: &str = "md";

/// Sync conflict records live under this reserved subdirectory.
pub const CONFLICTS_DIR: &str = ".conflicts";

/// Help text appended to every prompt so agents know the directive syntax.
pub const FORMAT_DOCS: &str = "\
## Output Directives

To schedule follow-up work, embed a schedule directive in your output:

    <!-- wt:schedule delay=\"10m\" -->
    describe the follow-up task here
    <!-- /wt:schedule -->

Attributes: `delay` (e.g. 30s, 10m, 1h, 1h 30m) or `at` (RFC3339 instant);
optional `memory` (comma-separated memory document names) and `after`
(a task id the follow-up waits for).

To overwrite a memory document, embed a memory directive:

    <!-- wt:memory file=\"notes\" -->
    replacement document content
    <!-- /wt:memory -->

Directives are stripped before your output is summarized.";
