pub mod api;
pub mod config;
pub mod engine;
pub mod executor;
pub mod feed;
pub mod gateway;
pub mod monitor;
pub mod reporter;
pub mod state;
pub mod timing;
pub mod types;

/// Appwrite project that owns the question collection.
/// Sent as the `X-Appwrite-Project` routing header on every call.
pub const PROJECT_ID: &str = "643c467a7dbb0655970d";

/// Realtime websocket URL, subscribed to the question documents channel.
pub const FEED_WS_URL: &str = "wss://server.acsdoubts.com/v1/realtime?project=643c467a7dbb0655970d&channels[]=databases.643d4f079b55031ba6b6.collections.643d4f2cd70649dd9083.documents";

/// Cloud function execution endpoint that performs the lock.
pub const CLAIM_URL: &str = "https://server.acsdoubts.com/v1/functions/lock-doubt/executions";

/// Current-session account endpoint ("who am I").
pub const ACCOUNT_URL: &str = "https://server.acsdoubts.com/v1/account";

/// Question documents endpoint, queried by `lockedBy`.
pub const QUESTIONS_URL: &str = "https://server.acsdoubts.com/v1/databases/643d4f079b55031ba6b6/collections/643d4f2cd70649dd9083/documents";

/// Site opened for manual login.
pub const WEBSITE_URL: &str = "https://acsdoubts.com";

/// Environment variable that overrides `session.cookie` from the config file.
pub const SESSION_COOKIE_VAR: &str = "AUTOLOCK_SESSION_COOKIE";
