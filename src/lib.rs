//! Halo server library
//!
//! Module layout:
//!   - knob             — tunable knob values and the per-`CodeVersion` `KnobSet`
//!   - random_quantity   — decaying ring-buffer statistic (call frequency, IPC)
//!   - code_region       — client-reported function layout, address lookup
//!   - call_graph        — caller/callee graph driving tuning-root selection
//!   - cct               — calling context tree built from perf samples
//!   - profiler          — perf sample ingestion, decay, hot-function detection
//!   - code_version      — compiled library identity, content-hash merging
//!   - config_manager    — candidate knob-config generation strategies
//!   - compiler          — compilation backend (stubbed codegen)
//!   - compilation_manager — non-blocking FIFO compile job queue
//!   - surrogate         — gradient-boosted-tree surrogate model
//!   - tuner             — pseudo-Bayesian config search over the surrogate
//!   - bakeoff           — online two-sample A/B comparison between versions
//!   - stopper           — statistical stop condition for the tuning loop
//!   - strategy          — `TuningSection` trait, the "jit"/compile-once strategy
//!   - section           — the adaptive bakeoff-driven tuning state machine
//!   - wire              — frame header, message bodies, async codec
//!   - config            — server configuration file (serverSettings + knobs)
//!   - cli               — command-line flags
//!   - logging           — tracing subscriber setup
//!   - errors            — error taxonomy
//!   - session           — per-client connection state and the read/write pump
//!   - group             — per-build-identity client group and its service loop
//!   - registrar         — TCP acceptor, client-to-group demultiplexing

pub mod knob;
pub mod random_quantity;
pub mod code_region;
pub mod call_graph;
pub mod cct;
pub mod profiler;
pub mod code_version;
pub mod config_manager;
pub mod compiler;
pub mod compilation_manager;
pub mod surrogate;
pub mod tuner;
pub mod bakeoff;
pub mod stopper;
pub mod strategy;
pub mod section;

pub mod wire;
pub mod config;
pub mod cli;
pub mod logging;
pub mod errors;

pub mod session;
pub mod group;
pub mod registrar;

pub use cli::Cli;
pub use config::ServerConfig;
pub use registrar::ClientRegistrar;
