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

//! Tiller is a TCP service-proxy data plane: discovery-driven cluster
//! membership, a hardened per-connection proxy filter, and a streaming
//! Thrift wire codec.

pub mod buffer;
pub mod cli;
pub mod cluster;
pub mod codec;
pub mod config;
pub(crate) mod metrics;
pub mod net;
pub mod proxy;
pub mod xds;

pub type Result<T, E = eyre::Error> = std::result::Result<T, E>;

#[doc(inline)]
pub use self::{buffer::ByteQueue, cli::Cli, config::Config};
