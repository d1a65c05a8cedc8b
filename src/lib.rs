//! # multigate-core
//!
//! Core engines for a multi-provider AI API gateway: protobuf/SSE wire codecs,
//! streaming chat engines, context compression, an agentic tool loop, and a
//! credential pool with quota enforcement.
//!
//! ## Overview
//!
//! This crate does not run an HTTP server itself. It provides the pieces a
//! gateway binary wires together:
//!
//! - **Request shaping**: [`assembler`] reshapes an external [`model::ChatRequest`]
//!   into the message list and tool set a provider actually expects.
//! - **Provider engines**: [`engine`] talks to two upstream chat providers
//!   behind one [`engine::ChatEngine`] trait — a JSON-event-stream provider
//!   ("Engine-K") and a protobuf/SSE provider ("Engine-W").
//! - **Wire codecs**: [`wire`] hand-rolls the Engine-W protobuf request frame
//!   and its SSE response decoder; [`stream_parser`] incrementally scans
//!   Engine-K's raw byte stream for embedded JSON objects.
//! - **Context compression**: [`compressor`] shrinks conversation history on a
//!   context-overflow signal, in escalating levels.
//! - **Agentic tool loop**: [`agentic_loop`] drives a bounded multi-turn
//!   conversation against Engine-W, executing a small allowlisted set of local
//!   tools between turns.
//! - **Credentials and quota**: [`credential`] pools upstream OAuth-style
//!   credentials with quarantine-on-repeated-failure; [`apikey`] enforces
//!   per-key rate, cost, and concurrency limits.
//! - **Sessions**: [`session`] holds per-conversation state (cascade id, turn
//!   id, message history) behind a bounded, evictable store.
//! - **Retry**: [`retry`] retries a fallible async operation with exponential
//!   backoff, gated on [`error::Error::is_retryable`].
//!
//! ## Architecture
//!
//! - **model**: Provider-agnostic message, content, and tool types shared by
//!   every other module.
//! - **config**: Per-provider base URLs, proxy configuration, and the
//!   machine-id hash used in Engine-W's device fingerprint.
//! - **error**: The crate-wide `Error` enum and `Result<T>` alias.
//! - **assembler**: Pre-dispatch request shaping (system prompt placement,
//!   role coalescing, tool filtering, tool-result dedup).
//! - **compressor**: Level-parameterized context compression.
//! - **stream_parser**: Engine-K's embedded-JSON stream scanner.
//! - **wire**: Engine-W's protobuf request encoder and SSE response decoder.
//! - **engine**: The `ChatEngine` trait and its two provider implementations.
//! - **agentic_loop**: Bounded multi-turn tool-execution loop over Engine-W.
//! - **credential**: Upstream credential pool with quarantine.
//! - **apikey**: Gateway-facing API key quota engine.
//! - **session**: Per-conversation session store.
//! - **retry**: Exponential-backoff retry helper.

mod agentic_loop;
mod apikey;
mod assembler;
mod compressor;
mod config;
mod credential;
mod engine;
mod error;
mod model;
mod session;
mod stream_parser;
mod wire;

/// Retry utilities with exponential backoff, made public as a module so
/// callers can configure retry behavior for their own dispatch code.
pub mod retry;

// --- Core domain model ---

pub use model::{
    ChatRequest, Content, ContentPart, Message, Role, SystemPrompt, ToolResultStatus, ToolSpec,
};

// --- Provider configuration ---

pub use config::{ProviderTag, get_base_url, get_http_proxy, machine_id_hash};

// --- Error handling ---

pub use error::{Error, Result};

// --- Request assembly ---

pub use assembler::{RequestAssembler, denylist_for};

// --- Context compression ---

pub use compressor::{ContextCompressor, MAX_COMPRESSION_LEVEL};

// --- Engine-K stream parsing ---

pub use stream_parser::{StreamEventK, StreamParser};

// --- Engine-W wire codec ---

pub use wire::{MODEL_CONFIG_MAGIC, RequestMetadata, SUPPORTED_MODEL_FAMILIES, WireEventW};

// --- Chat engines ---

pub use engine::{ChatEngine, ChatEvent, EngineK, EngineW, EventStream, ToolCallResult};

// --- Agentic tool loop ---

pub use agentic_loop::{
    AgenticLoopConfig, AgenticLoopResult, DEFAULT_MAX_ITERATIONS, ExecutedToolCall, TurnSource,
    run as run_agentic_loop,
};

// --- Credential pool ---

pub use credential::{Credential, CredentialPool, ERROR_QUARANTINE_THRESHOLD};

// --- API key quota engine ---

pub use apikey::{AdmissionGuard, ApiKey, LimitName, QuotaEngine};

// --- Session store ---

pub use session::{Session, SessionContext, SessionStore};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Commonly used types for a gateway binary built on this crate.
///
/// Import with `use multigate_core::prelude::*;`.
pub mod prelude {
    pub use crate::{
        AdmissionGuard, ApiKey, ChatEngine, ChatEvent, ChatRequest, Content, ContentPart,
        Credential, CredentialPool, EngineK, EngineW, Error, Message, QuotaEngine,
        RequestAssembler, Result, Role, Session, SessionContext, SessionStore, SystemPrompt,
        ToolSpec, run_agentic_loop,
    };
}
