// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod client;
pub mod error;
pub mod events;
mod ops;
mod tracker;
mod worker;

pub use client::Client;
pub use error::{ClientError, ClientResult};
pub use events::{ClientEvent, SUBSCRIBER_CHANNEL_CAPACITY};
pub use worker::{MAX_IN_FLIGHT, RETRANSMIT_BATCH};
