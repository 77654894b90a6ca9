/*
 * Copyright 2026 The Tiller Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The TCP proxy filter: routing, the per-connection state machine, the
//! deferred-flush drain manager, and the listener that drives them.

pub mod access_log;
pub mod config;
pub mod drain;
pub mod filter;
pub mod metrics;
pub mod server;

pub use access_log::{AccessLog, ResponseFlag, SessionInfo};
pub use config::{ProxyConfig, Route};
pub use drain::DrainManager;
pub use filter::{Action, CloseType, ConnectionEvent, Filter, State};
pub use server::Server;
