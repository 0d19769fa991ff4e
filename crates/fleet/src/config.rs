//! Fleet configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Which [`NodeProvider`](crate::provider::NodeProvider) backs the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    /// Runner processes spawned on the local host.
    Local {
        command: String,
        base_port: u16,
    },
    /// A managed-compute platform driven over its REST API.
    Platform { api_url: String, api_token: String },
}

/// Resources requested for each new node unless overridden per fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDefaults {
    pub cpu_milli: i32,
    pub memory_mb: i32,
    pub storage_mb: i32,
    pub idle_timeout_secs: i32,
}

/// How long a node may stay in each transient state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTimeouts {
    pub pending: Duration,
    pub starting: Duration,
    pub finishing: Duration,
    /// IDLE nodes whose teardown keeps failing move to ERROR after this.
    pub idle: Duration,
    /// TERMINATED rows are deleted after this.
    pub terminated_retention: Duration,
}

/// Fleet configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub fleet_id: String,
    pub provider: ProviderKind,
    pub min_nodes: i64,
    pub max_nodes: i64,
    /// STARTED tasks at which a node counts as full. `0` disables the limit.
    pub max_tasks_per_node: i64,
    pub node_defaults: NodeDefaults,
    pub tick_interval: Duration,
    pub lease_ttl: Duration,
    pub timeouts: StateTimeouts,
    /// Provider create attempts before a node is marked ERROR.
    pub provision_max_attempts: u32,
    pub runner_request_timeout: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            fleet_id: "default".into(),
            provider: ProviderKind::Local {
                command: "conduit-runner".into(),
                base_port: 3100,
            },
            min_nodes: 1,
            max_nodes: 10,
            max_tasks_per_node: 8,
            node_defaults: NodeDefaults {
                cpu_milli: 500,
                memory_mb: 512,
                storage_mb: 20_000,
                idle_timeout_secs: 300,
            },
            tick_interval: Duration::from_millis(1000),
            lease_ttl: Duration::from_secs(10),
            timeouts: StateTimeouts {
                pending: Duration::from_secs(300),
                starting: Duration::from_secs(300),
                finishing: Duration::from_secs(86_400),
                idle: Duration::from_secs(600),
                terminated_retention: Duration::from_secs(604_800),
            },
            provision_max_attempts: 5,
            runner_request_timeout: Duration::from_secs(10),
        }
    }
}

impl FleetConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                                 | Default          |
    /// |-----------------------------------------|------------------|
    /// | `FLEET_ID`                              | `default`        |
    /// | `FLEET_PROVIDER`                        | `local`          |
    /// | `FLEET_MIN_NODES` / `FLEET_MAX_NODES`   | `1` / `10`       |
    /// | `NODE_MAX_TASKS`                        | `8`              |
    /// | `NODE_CPU_MILLI` / `NODE_MEMORY_MB`     | `500` / `512`    |
    /// | `NODE_STORAGE_MB`                       | `20000`          |
    /// | `NODE_IDLE_TIMEOUT_SECS`                | `300`            |
    /// | `FLEET_TICK_MS`                         | `1000`           |
    /// | `LEADER_LEASE_TTL_SECS`                 | `10`             |
    /// | `FLEET_TIMEOUT_PENDING_SECS`            | `300`            |
    /// | `FLEET_TIMEOUT_STARTING_SECS`           | `300`            |
    /// | `FLEET_TIMEOUT_FINISHING_SECS`          | `86400`          |
    /// | `FLEET_TIMEOUT_IDLE_SECS`               | `600`            |
    /// | `FLEET_TERMINATED_RETENTION_SECS`       | `604800`         |
    /// | `FLEET_PROVISION_MAX_ATTEMPTS`          | `5`              |
    /// | `RUNNER_REQUEST_TIMEOUT_SECS`           | `10`             |
    /// | `LOCAL_RUNNER_COMMAND`                  | `conduit-runner` |
    /// | `LOCAL_RUNNER_BASE_PORT`                | `3100`           |
    /// | `PLATFORM_API_URL` / `PLATFORM_API_TOKEN` | required for `platform` |
    pub fn from_env() -> Self {
        let provider = match env_or("FLEET_PROVIDER", "local".to_string()).as_str() {
            "local" => ProviderKind::Local {
                command: env_or("LOCAL_RUNNER_COMMAND", "conduit-runner".to_string()),
                base_port: env_or("LOCAL_RUNNER_BASE_PORT", 3100),
            },
            "platform" => ProviderKind::Platform {
                api_url: std::env::var("PLATFORM_API_URL")
                    .expect("PLATFORM_API_URL must be set when FLEET_PROVIDER=platform"),
                api_token: std::env::var("PLATFORM_API_TOKEN")
                    .expect("PLATFORM_API_TOKEN must be set when FLEET_PROVIDER=platform"),
            },
            other => panic!("FLEET_PROVIDER must be `local` or `platform`, got `{other}`"),
        };

        let min_nodes: i64 = env_or("FLEET_MIN_NODES", 1);
        let max_nodes: i64 = env_or("FLEET_MAX_NODES", 10);
        assert!(
            min_nodes <= max_nodes,
            "FLEET_MIN_NODES must not exceed FLEET_MAX_NODES"
        );

        let idle_timeout_secs: i32 = env_or("NODE_IDLE_TIMEOUT_SECS", 300);
        assert!(idle_timeout_secs > 0, "NODE_IDLE_TIMEOUT_SECS must be positive");

        Self {
            fleet_id: env_or("FLEET_ID", "default".to_string()),
            provider,
            min_nodes,
            max_nodes,
            max_tasks_per_node: env_or("NODE_MAX_TASKS", 8),
            node_defaults: NodeDefaults {
                cpu_milli: env_or("NODE_CPU_MILLI", 500),
                memory_mb: env_or("NODE_MEMORY_MB", 512),
                storage_mb: env_or("NODE_STORAGE_MB", 20_000),
                idle_timeout_secs,
            },
            tick_interval: Duration::from_millis(env_or("FLEET_TICK_MS", 1000)),
            lease_ttl: Duration::from_secs(env_or("LEADER_LEASE_TTL_SECS", 10)),
            timeouts: StateTimeouts {
                pending: secs("FLEET_TIMEOUT_PENDING_SECS", 300),
                starting: secs("FLEET_TIMEOUT_STARTING_SECS", 300),
                finishing: secs("FLEET_TIMEOUT_FINISHING_SECS", 86_400),
                idle: secs("FLEET_TIMEOUT_IDLE_SECS", 600),
                terminated_retention: secs("FLEET_TERMINATED_RETENTION_SECS", 604_800),
            },
            provision_max_attempts: env_or("FLEET_PROVISION_MAX_ATTEMPTS", 5),
            runner_request_timeout: secs("RUNNER_REQUEST_TIMEOUT_SECS", 10),
        }
    }
}

fn secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(name, default))
}

/// Read and parse an environment variable, falling back to `default` when
/// it is unset. Panics on a value that does not parse.
fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("{name} is invalid: {e}")),
        Err(_) => default,
    }
}
