// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rate limiting and retry for outbound calls.

pub mod gate;
pub mod retry;
