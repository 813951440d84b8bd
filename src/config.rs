//! Shared configuration for the bridge core and the threaded runtime.
//!
//! Uses `heapless::String` for `no_std` compatibility while remaining
//! ergonomic to use on desktop with `std`.
//!
//! # Example
//!
//! ```rust
//! use rs_throttle_bridge::config::{Config, NetworkConfig, RelayConfig};
//!
//! // Use defaults
//! let config = Config::default();
//! assert_eq!(config.relay.port, 12090);
//!
//! // Or customize
//! let config = Config::default()
//!     .with_network(NetworkConfig::default().with_host("192.168.4.1").with_port(2560))
//!     .with_relay(RelayConfig::default().with_max_clients(6));
//! ```

use alloc::vec::Vec;

use heapless::String as HString;

use crate::entities::{Route, DEFAULT_FUNCTION_LATCH, MAX_CONSIST_SIZE};

/// Maximum length for short config strings (hostnames, node names)
pub const MAX_SHORT_STRING: usize = 64;

/// Maximum length for longer config strings (paths)
pub const MAX_LONG_STRING: usize = 128;

/// Type alias for short config strings
pub type ShortString = HString<MAX_SHORT_STRING>;

/// Type alias for longer config strings
pub type LongString = HString<MAX_LONG_STRING>;

/// Default WiThrottle relay port.
pub const DEFAULT_RELAY_PORT: u16 = 12090;

/// Hard limit on concurrent relay clients.
pub const MAX_RELAY_CLIENTS: usize = 8;

/// Default number of relay clients.
pub const DEFAULT_RELAY_CLIENTS: usize = 4;

/// Hard limit on the automation call/loop stack.
pub const MAX_STACK_DEPTH: usize = 16;

// ============================================================================
// Helper for creating heapless strings
// ============================================================================

/// Create a bounded string from a &str, truncating at a UTF-8 boundary.
pub fn bounded_string<const N: usize>(s: &str) -> HString<N> {
    let mut hs = HString::new();
    // Take only what fits
    let take = s.len().min(N);
    let valid_end = s
        .char_indices()
        .take_while(|(i, c)| i + c.len_utf8() <= take)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let _ = hs.push_str(&s[..valid_end]);
    hs
}

/// Create a ShortString from a &str, truncating if too long
pub fn short_string(s: &str) -> ShortString {
    bounded_string(s)
}

/// Create a LongString from a &str, truncating if too long
pub fn long_string(s: &str) -> LongString {
    bounded_string(s)
}

// ============================================================================
// Main Config
// ============================================================================

/// Complete bridge configuration
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Upstream command-station session
    pub network: NetworkConfig,
    /// Downstream relay listener
    pub relay: RelayConfig,
    /// Locomotive handling
    pub throttle: ThrottleConfig,
    /// Automation engine limits
    pub automation: AutomationConfig,
    /// Device identification
    pub device: DeviceConfig,
    /// Routes whose steps are driven from this bridge
    pub routes: Vec<Route>,
}

impl Config {
    /// Set network configuration
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Set relay configuration
    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Set throttle configuration
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Set automation configuration
    pub fn with_automation(mut self, automation: AutomationConfig) -> Self {
        self.automation = automation;
        self
    }

    /// Set device configuration
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Add a locally defined route
    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }
}

// ============================================================================
// Network Config
// ============================================================================

/// Upstream session configuration
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkConfig {
    /// Command station host or IP
    pub host: ShortString,
    /// Command station port
    pub port: u16,
    /// Window for the first recognisable frame
    pub init_wait_ms: u64,
    /// Grace period added to the keepalive interval before declaring silence
    pub timeout_ms: u64,
    /// Interval between keepalive probes
    pub keepalive_ms: u64,
    /// Send the DCC-Ex status probe on connect
    pub identify_probe: bool,
    /// Consecutive malformed frames tolerated before degrading
    pub max_parse_errors: u8,
    /// Reconnect attempts before giving up (0 = never reconnect)
    pub max_retries: u8,
    /// First reconnect delay
    pub initial_backoff_ms: u64,
    /// Upper bound on the reconnect delay
    pub max_backoff_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: short_string("192.168.4.1"),
            port: DEFAULT_RELAY_PORT,
            init_wait_ms: 5_000,
            timeout_ms: 2_000,
            keepalive_ms: 10_000,
            identify_probe: true,
            max_parse_errors: 5,
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl NetworkConfig {
    /// Set the command station host
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = short_string(host);
        self
    }

    /// Set the command station port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the identification window
    pub fn with_init_wait_ms(mut self, ms: u64) -> Self {
        self.init_wait_ms = ms;
        self
    }

    /// Set the keepalive grace period
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Set the keepalive interval
    pub fn with_keepalive_ms(mut self, ms: u64) -> Self {
        self.keepalive_ms = ms.max(1);
        self
    }

    /// Enable or disable the identify probe
    pub fn with_identify_probe(mut self, probe: bool) -> Self {
        self.identify_probe = probe;
        self
    }

    /// Set the malformed-frame tolerance
    pub fn with_max_parse_errors(mut self, count: u8) -> Self {
        self.max_parse_errors = count;
        self
    }

    /// Set the reconnect attempt limit
    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the reconnect backoff bounds
    pub fn with_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.initial_backoff_ms = initial;
        self.max_backoff_ms = max.max(initial);
        self
    }

    /// Backoff before reconnect attempt `attempt` (0-based), doubling each time.
    pub fn backoff_ms(&self, attempt: u8) -> u64 {
        let shift = u32::from(attempt.min(16));
        self.initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }
}

// ============================================================================
// Relay Config
// ============================================================================

/// Downstream relay configuration
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RelayConfig {
    /// Port to listen on
    pub port: u16,
    /// Concurrent client slots (clamped to [`MAX_RELAY_CLIENTS`])
    pub max_clients: usize,
    /// Idle time after which a client is considered gone
    pub keepalive_ms: u64,
    /// Heartbeat interval advertised to WiThrottle clients
    pub heartbeat_secs: u16,
    /// Whether the relay listener runs
    pub enabled: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RELAY_PORT,
            max_clients: DEFAULT_RELAY_CLIENTS,
            keepalive_ms: 30_000,
            heartbeat_secs: 10,
            enabled: true,
        }
    }
}

impl RelayConfig {
    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the client slot count
    pub fn with_max_clients(mut self, n: usize) -> Self {
        self.max_clients = n.clamp(1, MAX_RELAY_CLIENTS);
        self
    }

    /// Set the idle timeout
    pub fn with_keepalive_ms(mut self, ms: u64) -> Self {
        self.keepalive_ms = ms;
        self
    }

    /// Set the advertised heartbeat
    pub fn with_heartbeat_secs(mut self, secs: u16) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    /// Enable or disable the relay
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

// ============================================================================
// Throttle Config
// ============================================================================

/// Locomotive handling configuration
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThrottleConfig {
    /// Latching mask applied to locomotives without roster labels
    pub function_latch: u32,
    /// Locomotives one control path may own
    pub max_consist: usize,
    /// Present lists sorted by name instead of arrival order
    pub sort_lists: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            function_latch: DEFAULT_FUNCTION_LATCH,
            max_consist: MAX_CONSIST_SIZE,
            sort_lists: false,
        }
    }
}

impl ThrottleConfig {
    /// Set the latching mask
    pub fn with_function_latch(mut self, mask: u32) -> Self {
        self.function_latch = mask;
        self
    }

    /// Set the consist limit
    pub fn with_max_consist(mut self, n: usize) -> Self {
        self.max_consist = n.clamp(1, MAX_CONSIST_SIZE);
        self
    }

    /// Sort presented lists by name
    pub fn with_sort_lists(mut self, sort: bool) -> Self {
        self.sort_lists = sort;
        self
    }
}

// ============================================================================
// Automation Config
// ============================================================================

/// Automation engine configuration
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AutomationConfig {
    /// Process table size
    pub max_processes: usize,
    /// Call/loop stack depth per process chain (clamped to [`MAX_STACK_DEPTH`])
    pub stack_depth: usize,
    /// Instructions a process may run per tick before yielding
    pub steps_per_tick: usize,
    /// Lines kept in the trace ring
    pub trace_capacity: usize,
    /// Scheduler tick period
    pub tick_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            max_processes: 8,
            stack_depth: 8,
            steps_per_tick: 32,
            trace_capacity: 64,
            tick_ms: 20,
        }
    }
}

impl AutomationConfig {
    /// Set the process table size
    pub fn with_max_processes(mut self, n: usize) -> Self {
        self.max_processes = n.clamp(1, u8::MAX as usize);
        self
    }

    /// Set the stack depth
    pub fn with_stack_depth(mut self, depth: usize) -> Self {
        self.stack_depth = depth.clamp(1, MAX_STACK_DEPTH);
        self
    }

    /// Set the per-tick instruction budget
    pub fn with_steps_per_tick(mut self, steps: usize) -> Self {
        self.steps_per_tick = steps.max(1);
        self
    }

    /// Set the trace ring size
    pub fn with_trace_capacity(mut self, n: usize) -> Self {
        self.trace_capacity = n;
        self
    }

    /// Set the tick period
    pub fn with_tick_ms(mut self, ms: u64) -> Self {
        self.tick_ms = ms.max(1);
        self
    }
}

// ============================================================================
// Device Config
// ============================================================================

/// Device identification configuration
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceConfig {
    /// Name announced to servers (`N`) and to relay clients
    pub name: ShortString,
    /// Hardware id announced to WiThrottle servers (`HU`)
    pub id: ShortString,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: short_string("mThrottle"),
            id: short_string("mThrottle-0001"),
        }
    }
}

impl DeviceConfig {
    /// Set the device name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = short_string(name);
        self
    }

    /// Set the hardware id
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = short_string(id);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
