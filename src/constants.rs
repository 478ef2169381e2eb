/// Default Ollama API base URL
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Provider name stored on models served by the Ollama backend
pub const OLLAMA_PROVIDER: &str = "ollama";

/// Default listen port
pub const DEFAULT_PORT: u16 = 8000;

/// Default bearer token lifetime
pub const DEFAULT_TOKEN_TTL_MINUTES: u64 = 30;

/// Default bound on in-flight inference requests
pub const MAX_CONCURRENT_INFERENCE: usize = 16;

/// Context length assigned to models discovered by sync (the tags listing doesn't report it)
pub const SYNC_CONTEXT_LENGTH: i64 = 4096;

/// Capabilities assigned to models discovered by sync
pub static SYNC_CAPABILITIES: &[&str] = &["code_completion", "chat"];

/// Window over which a grant's token limit applies (24 hours, ms)
pub const TOKEN_LIMIT_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Generation defaults for `/autocomplete`
pub const AUTOCOMPLETE_MAX_TOKENS: u32 = 256;
pub const AUTOCOMPLETE_TEMPERATURE: f64 = 0.2;

/// Generation defaults for `/chat`
pub const CHAT_MAX_TOKENS: u32 = 1024;
pub const CHAT_TEMPERATURE: f64 = 0.7;
