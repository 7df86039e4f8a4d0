// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP trigger surface.
//!
//! | Method | Path                            | Purpose                          |
//! |--------|---------------------------------|----------------------------------|
//! | POST   | `/sync/trigger`                 | start a run in the background    |
//! | POST   | `/sync/scheduled`               | run every account now            |
//! | GET    | `/sync/status`                  | recent ledger rows + conflicts   |
//! | GET    | `/sync/stats`                   | per-entity counts, last sync     |
//! | GET    | `/sync/runs`                    | run log                          |
//! | GET    | `/sync/conflicts`               | pending conflicts                |
//! | POST   | `/sync/conflicts/{id}/resolve`  | settle one conflict              |
//! | GET    | `/health`                       | liveness and gate usage          |

mod error;
mod routes;

pub use error::AppError;
pub use routes::{app_router, AppState};
