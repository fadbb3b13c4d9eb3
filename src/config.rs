// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

/// Configuration for the fan-out server.
#[derive(Debug, Clone, clap::Args)]
pub struct FanoutConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "FANOUT_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "FANOUT_PORT")]
    pub port: u16,

    /// Per-client outbound queue capacity (`Q`).
    #[arg(long, default_value_t = 1024, env = "FANOUT_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Consecutive full-queue enqueue failures before a client is evicted.
    #[arg(long, default_value_t = 3, env = "FANOUT_SLOW_CLIENT_STRIKES")]
    pub slow_client_strikes: u32,

    /// Per-write deadline in milliseconds (`Dwrite`).
    #[arg(long, default_value_t = 5_000, env = "FANOUT_WRITE_DEADLINE_MS")]
    pub write_deadline_ms: u64,

    /// Rolling read deadline in milliseconds (`pongWait`).
    #[arg(long, default_value_t = 30_000, env = "FANOUT_PONG_WAIT_MS")]
    pub pong_wait_ms: u64,

    /// Protocol ping period in milliseconds, nominally `0.9 * pongWait`.
    #[arg(long, default_value_t = 27_000, env = "FANOUT_PING_PERIOD_MS")]
    pub ping_period_ms: u64,

    /// Per-client inbound token-bucket burst.
    #[arg(long, default_value_t = 100, env = "FANOUT_CLIENT_RATE_BURST")]
    pub client_rate_burst: u32,

    /// Per-client inbound token-bucket sustained rate (messages/sec).
    #[arg(long, default_value_t = 10.0, env = "FANOUT_CLIENT_RATE_PER_SEC")]
    pub client_rate_per_sec: f64,

    /// Per-IP connection token-bucket burst.
    #[arg(long, default_value_t = 20, env = "FANOUT_PER_IP_CONN_BURST")]
    pub per_ip_conn_burst: u32,

    /// Per-IP connection token-bucket sustained rate (connections/sec).
    #[arg(long, default_value_t = 2.0, env = "FANOUT_PER_IP_CONN_PER_SEC")]
    pub per_ip_conn_per_sec: f64,

    /// Global connection token-bucket sustained rate (connections/sec). Unset
    /// disables the global bucket (per-IP and resource-guard admission still
    /// apply).
    #[arg(long, env = "FANOUT_GLOBAL_CONN_PER_SEC")]
    pub global_conn_per_sec: Option<f64>,

    /// Global connection token-bucket burst, used only if the rate is set.
    #[arg(long, default_value_t = 200, env = "FANOUT_GLOBAL_CONN_BURST")]
    pub global_conn_burst: u32,

    /// Hard cap on concurrent connections.
    #[arg(long, default_value_t = 10_000, env = "FANOUT_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Reject admission above this container CPU percentage.
    #[arg(long, default_value_t = 75.0, env = "FANOUT_CPU_REJECT_THRESHOLD")]
    pub cpu_reject_threshold: f32,

    /// Pause ingress consumption above this container CPU percentage.
    #[arg(long, default_value_t = 80.0, env = "FANOUT_CPU_PAUSE_THRESHOLD")]
    pub cpu_pause_threshold: f32,

    /// Reject admission above this resident memory, in bytes.
    #[arg(long, default_value_t = 2_147_483_648, env = "FANOUT_MEMORY_LIMIT_BYTES")]
    pub memory_limit_bytes: u64,

    /// Reject admission above this many live tasks.
    #[arg(long, default_value_t = 50_000, env = "FANOUT_MAX_TASKS")]
    pub max_tasks: usize,

    /// Resource Guard sampling interval in milliseconds.
    #[arg(long, default_value_t = 15_000, env = "FANOUT_SAMPLE_INTERVAL_MS")]
    pub sample_interval_ms: u64,

    /// Ingress token-bucket sustained rate (events/sec); burst is `2x`.
    #[arg(long, default_value_t = 1_000.0, env = "FANOUT_INGRESS_RATE_PER_SEC")]
    pub ingress_rate_per_sec: f64,

    /// Broadcast token-bucket sustained rate (events/sec); burst is `2x`.
    /// Advisory only: this engine does not wire it into the broadcast hot
    /// path.
    #[arg(long, default_value_t = 1_000.0, env = "FANOUT_BROADCAST_RATE_PER_SEC")]
    pub broadcast_rate_per_sec: f64,

    /// Max ingress records batched before a forced flush (`B`).
    #[arg(long, default_value_t = 50, env = "FANOUT_INGRESS_BATCH_MAX")]
    pub ingress_batch_max: usize,

    /// Max time to accumulate an ingress batch before a forced flush, in
    /// milliseconds (`T`).
    #[arg(long, default_value_t = 10, env = "FANOUT_INGRESS_BATCH_MS")]
    pub ingress_batch_ms: u64,

    /// Per-call budget for a reconnect/replay request, in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "FANOUT_REPLAY_BUDGET_MS")]
    pub replay_budget_ms: u64,

    /// Max envelopes returned by a single reconnect/replay call.
    #[arg(long, default_value_t = 500, env = "FANOUT_REPLAY_MAX_RECORDS")]
    pub replay_max_records: usize,

    /// Grace period for draining clients on shutdown, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "FANOUT_SHUTDOWN_GRACE_MS")]
    pub shutdown_grace_ms: u64,

    /// NATS server URL the Ingress Consumer pulls from. Unset runs with no
    /// ingress source wired (broadcast engine is still reachable directly,
    /// e.g. from tests).
    #[arg(long, env = "FANOUT_NATS_URL")]
    pub nats_url: Option<String>,

    /// NATS subject pattern the Ingress Consumer subscribes to.
    #[arg(long, default_value = "odin.token.>", env = "FANOUT_NATS_SUBJECT")]
    pub nats_subject: String,
}

impl FanoutConfig {
    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn ingress_batch_window(&self) -> Duration {
        Duration::from_millis(self.ingress_batch_ms)
    }

    pub fn replay_budget(&self) -> Duration {
        Duration::from_millis(self.replay_budget_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            queue_capacity: 1024,
            slow_client_strikes: 3,
            write_deadline_ms: 5_000,
            pong_wait_ms: 30_000,
            ping_period_ms: 27_000,
            client_rate_burst: 100,
            client_rate_per_sec: 10.0,
            per_ip_conn_burst: 20,
            per_ip_conn_per_sec: 2.0,
            global_conn_per_sec: None,
            global_conn_burst: 200,
            max_connections: 10_000,
            cpu_reject_threshold: 75.0,
            cpu_pause_threshold: 80.0,
            memory_limit_bytes: 2_147_483_648,
            max_tasks: 50_000,
            sample_interval_ms: 15_000,
            ingress_rate_per_sec: 1_000.0,
            broadcast_rate_per_sec: 1_000.0,
            ingress_batch_max: 50,
            ingress_batch_ms: 10,
            replay_budget_ms: 5_000,
            replay_max_records: 500,
            shutdown_grace_ms: 30_000,
            nats_url: None,
            nats_subject: "odin.token.>".to_owned(),
        }
    }
}
