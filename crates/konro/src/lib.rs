//! # Konro
//!
//! Instance lifecycle and execution dispatch for multi-backend
//! inference serving.
//!
//! ## Overview
//!
//! Each served model may be replicated across one or more instances bound to
//! specific compute devices. This crate decides which instances may share an
//! execution thread, drives each instance through initialization and
//! synthetic warmup before it accepts live traffic, and serializes request
//! execution per thread to respect device concurrency limits.
//!
//! Key components include:
//!
//! - A consumable signature key deciding which instance declarations may
//!   share an execution thread
//! - Dedicated device-bound worker threads with controlled start/stop
//! - A warmup coordinator synthesizing representative request batches
//! - A non-blocking, thread-safe scheduling entry point with exactly-once
//!   completion
//!
//! ## Architecture
//!
//! [`Model::load`] consumes the validated model configuration, builds a
//! signature per declared replica, pairwise-matches signatures to share
//! threads among device-blocking instances, and initializes and warms up
//! every instance on its own thread before returning. At serving time,
//! callers hand [`ModelInstance::schedule`] a batch of requests and a
//! completion continuation; the batch is enqueued to the instance's thread,
//! executed in FIFO order across all instances sharing that thread, and the
//! continuation fires once the backend call returns.
//!
//! ### Assumptions
//!
//! The crate treats several collaborators as external: parsing and
//! validation of the configuration document, the backend tensor computation
//! itself (behind the [`Backend`] trait), the rate limiter's admission
//! policy (consulted before `schedule` is called), and metrics aggregation
//! and export.
//!
//! ## Implementation Details
//!
//! One OS worker thread backs each [`BackendThread`]; `schedule` is safe to
//! call from many threads simultaneously and never blocks, handing off
//! through an unbounded multi-producer queue. Queue depth is governed by the
//! external rate limiter's admission decisions, not by this crate.

mod communication;
mod core;
mod instance;
mod model;

pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;

pub use backend::{Backend, BackendRequest, InstanceState};
pub use communication::{
    CompletionCallback, InferenceRequest, InferenceResponse, ResponseStream, Tensor,
};
pub use crate::core::BackendThread;
pub use error::CoreError;
pub use instance::{ModelInstance, SecondaryDevice, Signature};
pub use model::{Model, ModelShared};
