use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (job queue backend)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Address the API server binds to (default: 0.0.0.0:3000)
    pub api_bind_addr: String,

    /// Key prefix for every Redis key owned by the job queue
    pub queue_prefix: String,

    /// Number of jobs a worker processes concurrently (default: 8)
    pub worker_concurrency: usize,

    /// Sleep between empty queue polls in milliseconds (default: 250)
    pub worker_poll_interval_ms: u64,

    /// How long a reserved job may stay in flight before it is considered stalled
    pub job_lease_ms: u64,

    /// Whether the worker schedules delivery retries after failed runs
    pub retry_supervisor_enabled: bool,

    /// Firebase project id for FCM HTTP v1
    pub fcm_project_id: Option<String>,

    /// OAuth2 access token for FCM
    pub fcm_access_token: Option<String>,

    /// APNs topic (usually the app bundle id)
    pub apns_topic: Option<String>,

    /// APNs provider authentication token (JWT)
    pub apns_auth_token: Option<String>,

    /// Use the APNs sandbox host instead of production
    pub apns_sandbox: bool,

    /// Timeout for a single push request in milliseconds (default: 10000)
    pub push_request_timeout_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            queue_prefix: std::env::var("QUEUE_PREFIX")
                .unwrap_or_else(|_| "beacon:notifications".to_string()),
            worker_concurrency: std::env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_CONCURRENCY must be a valid usize"))?,
            worker_poll_interval_ms: std::env::var("WORKER_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_POLL_INTERVAL_MS must be a valid u64"))?,
            job_lease_ms: std::env::var("JOB_LEASE_MS")
                .unwrap_or_else(|_| "300000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("JOB_LEASE_MS must be a valid u64"))?,
            retry_supervisor_enabled: std::env::var("RETRY_SUPERVISOR_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RETRY_SUPERVISOR_ENABLED must be true or false"))?,
            fcm_project_id: std::env::var("FCM_PROJECT_ID").ok(),
            fcm_access_token: std::env::var("FCM_ACCESS_TOKEN").ok(),
            apns_topic: std::env::var("APNS_TOPIC").ok(),
            apns_auth_token: std::env::var("APNS_AUTH_TOKEN").ok(),
            apns_sandbox: std::env::var("APNS_SANDBOX")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("APNS_SANDBOX must be true or false"))?,
            push_request_timeout_ms: std::env::var("PUSH_REQUEST_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PUSH_REQUEST_TIMEOUT_MS must be a valid u64"))?,
        })
    }
}
