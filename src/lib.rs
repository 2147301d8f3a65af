#![forbid(unsafe_code)]

//! # atelier
//!
//! Queue-backed worker service for multi-stage AI fashion media pipelines.
//!
//! A request enters through the webhook surface, passes admission control
//! (sliding-window rate limiting plus a concurrency guard when the
//! distributed queue is unavailable), and becomes a job on a reliable
//! FIFO queue. A single dispatcher per replica drains the queue and drives
//! each job's pipeline — try-on renders, identity transfer, composition,
//! video synthesis — through submit-and-poll provider gateways, recording
//! durable status in the external job store and ephemeral state in the
//! queue metadata. Replica count is steered by a queue-depth autoscaling
//! signal; everything observable lands in an in-memory metrics registry.
//!
//! The binary in `src/main.rs` is the composition root; every component
//! here takes its collaborators (clock, sleeper, backends, stores) as
//! constructor arguments so the test suite can run the whole machine on
//! in-memory fakes and a local mock provider.

pub mod admission;
pub mod autoscaler;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod http;
pub mod jobstore;
pub mod metrics;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod rate_limit;
pub mod store;
pub mod time;

pub use admission::{AdmissionOutcome, AdmissionService};
pub use autoscaler::{AutoscalerConfig, ScalingDecision};
pub use backoff::{Backoff, Jitter};
pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use error::{ConfigError, GatewayError, PipelineError, QueueError, StoreError};
pub use gateway::{PollState, ProviderConfig, ProviderGateway, SubmitOutcome};
pub use guard::JobSlots;
pub use jobstore::{JobStore, MemoryJobStore, RestJobStore};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use pipeline::PipelineOrchestrator;
pub use providers::{ProviderCatalog, Tier};
pub use queue::{JobMeta, JobStatus, TaskKind, TaskQueue};
pub use rate_limit::{FallbackLimiter, RateDecision, RateLimiter, RedisRateLimiter};
pub use store::{MemoryBackend, QueueBackend, RedisBackend};
pub use time::{Clock, InstantSleeper, ManualClock, Sleeper, SystemClock, TokioSleeper};
