// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Consumer
//!
//! Concurrency-limited AMQP consumption engine on top of lapin: pooled
//! broker connections, bounded per-pool handler execution, a wait-slot
//! request/response pattern, and consumer dispatch with redelivery and
//! delay-exchange semantics.

mod otel;

pub mod concurrent;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod definition;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod rpc;
pub mod topology;
pub mod wait;
