// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

pub mod agent;
pub mod config;
pub mod events;
pub mod llm;
pub mod repository;
