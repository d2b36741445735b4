/*
 * lib.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a self-hostable mail server.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Portalettere server core: the SMTP/ESMTP protocol engine and the ingress
//! control plane around it (rate limiting, greylisting, DNSBL consultation,
//! SASL authentication), backed by a SQLite message store and delivery
//! queue. Frontends add the listener wiring, configuration loading and log
//! sinks; downstream protocol servers read what this crate stores.

pub mod auth;
pub mod config;
pub mod dnsbl;
pub mod error;
pub mod greylist;
pub mod limiter;
pub mod message_id;
pub mod net;
pub mod protocol;
pub mod queue;
pub mod sasl;
pub mod server;
pub mod store;

pub use config::ServerConfig;
pub use error::Error;
pub use server::{Core, Server, ServerHandle};
