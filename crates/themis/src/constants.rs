//! Judge-wide constants
//!
//! Defaults for every tunable in [`crate::config`], grouped by the component
//! that consumes them.

// =============================================================================
// SERVICE DEFAULTS
// =============================================================================

/// Default Prometheus metrics port
pub const DEFAULT_METRICS_PORT: u16 = 9091;

/// Default maximum database connections in the pool
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

// =============================================================================
// SCHEDULER DEFAULTS
// =============================================================================

/// Default number of concurrent judging workers
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default maximum number of queued (pending) submissions
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default retry budget for infrastructure failures
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the exponential retry backoff
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

/// Upper bound of the retry backoff
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

/// How often the binary looks for pending submissions written by the API
pub const DEFAULT_PENDING_POLL_INTERVAL_MS: u64 = 2_000;

/// How often the binary re-applies statistics that never committed
pub const DEFAULT_STATS_SWEEP_INTERVAL_SECS: u64 = 30;

/// Age after which a RUNNING submission is considered abandoned
pub const DEFAULT_STALE_RUNNING_AFTER_SECS: u64 = 600;

/// Compare-and-swap attempts before a stats update gives up with a conflict
pub const STATS_CAS_ATTEMPTS: u32 = 16;

/// Submissions fetched per page by the recovery sweep
pub const RECOVERY_BATCH_SIZE: usize = 100;

// =============================================================================
// INTAKE DEFAULTS
// =============================================================================

/// Default maximum source size in bytes
pub const DEFAULT_MAX_CODE_BYTES: usize = 64 * 1024;

// =============================================================================
// SANDBOX DEFAULTS
// =============================================================================

/// Wall-clock limit for the compile step
pub const DEFAULT_COMPILE_TIME_LIMIT_MS: u64 = 10_000;

/// Memory limit for the compile step
pub const DEFAULT_COMPILE_MEMORY_LIMIT_MB: u64 = 1024;

/// Maximum captured stdout per run
pub const DEFAULT_OUTPUT_LIMIT_BYTES: u64 = 16 * 1024 * 1024;

/// Maximum captured stderr / compiler log
pub const DIAGNOSTIC_LIMIT_BYTES: usize = 8 * 1024;

/// Interval between peak-memory samples
pub const DEFAULT_MEMORY_POLL_INTERVAL_MS: u64 = 10;

/// Address space ceiling as a multiple of the memory limit
pub const DEFAULT_ADDRESS_SPACE_MULTIPLIER: u64 = 2;

/// Upper bound accepted for a problem's time limit
pub const DEFAULT_MAX_TIME_LIMIT_MS: u64 = 30_000;

/// Upper bound accepted for a problem's memory limit
pub const DEFAULT_MAX_MEMORY_LIMIT_MB: u64 = 2048;

/// The only PATH visible to compilers and submitted programs
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// First uid (and gid) handed to sandboxed programs when the judge is root
pub const DEFAULT_SANDBOX_UID_BASE: u32 = 60_000;

/// Number of sandbox uids, and so of programs running at once
pub const DEFAULT_SANDBOX_UID_COUNT: u32 = 64;

/// RLIMIT_NPROC of a sandboxed program
pub const DEFAULT_MAX_PROCESSES: u64 = 64;

/// Host paths bound read-only into every jail, when present
pub const JAIL_SYSTEM_PATHS: &[&str] = &[
    "/bin",
    "/lib",
    "/lib32",
    "/lib64",
    "/libx32",
    "/usr",
    "/etc/alternatives",
    "/etc/ld.so.cache",
];

/// Device nodes bound into every jail
pub const JAIL_DEVICES: &[&str] = &["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];

/// Lowercase stderr fragments printed by common runtimes when an allocation
/// is refused
pub const ALLOCATION_FAILURE_MARKERS: &[&str] = &[
    "memoryerror",
    "bad_alloc",
    "memory allocation of",
    "out of memory",
    "outofmemoryerror",
    "cannot allocate",
    "out of space",
];

/// Message stored on submissions that end in JUDGE_ERROR
pub const JUDGE_ERROR_MESSAGE: &str = "Internal judge error, please resubmit";
