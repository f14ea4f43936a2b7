//! Conversation pipeline for Intake.
//!
//! Buffers messages from unidentified participants, resolves identity by
//! pin, migrates buffered history into permanent conversations, drives the
//! AI interview, and completes each interview exactly once. Side effects
//! leave through the job bus, either best-effort or via the outbox.

pub mod coalesce;
pub mod completion;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod jobs;
pub mod migrator;
pub mod orchestrator;
pub mod rate_limit;
pub mod relay;
pub mod replies;
pub mod responder;
pub mod state_machine;
pub mod unidentified;
pub mod watchdog;

pub use coalesce::BurstCoalescer;
pub use completion::{format_transcript, CompletionCoordinator, CompletionOutcome};
pub use dispatch::{enqueue_durable, send_best_effort};
pub use error::ChatError;
pub use gateway::{ChannelGateway, GatewayOutcome};
pub use identity::{looks_like_pin, IdentityResolver, IssuedPin};
pub use jobs::{JobBus, JobConsumer, QueueConsumer, RoutingJobBus, SeenKeys};
pub use migrator::MessageMigrator;
pub use orchestrator::{ConversationOrchestrator, OrchestratorReply, TranscriptOutcome};
pub use rate_limit::{Decision, InProcessRateLimiter, RateLimiter, Unlimited};
pub use relay::{OutboxRelay, RelayStats};
pub use replies::ScriptedReply;
pub use responder::{AiResponder, AiTurn, ScriptedResponder, TurnContext};
pub use unidentified::{BufferOutcome, UnidentifiedSessionStore};
pub use watchdog::{SweepStats, TimeoutWatchdog};
