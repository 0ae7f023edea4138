// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A publish/subscribe message broker: long-lived TCP sessions speak
//! a small binary framing protocol (PSMB), each playing the role of
//! publisher or subscriber for the session's lifetime, fanned out
//! through a process-wide pattern-matching dispatcher.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod pattern;
pub mod session;
pub mod wire;
pub mod worker;

pub use dispatcher::{Dispatcher, SubscriberId};
pub use error::{Error, Result};
pub use session::Session;
pub use worker::Broker;
