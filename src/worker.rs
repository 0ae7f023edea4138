// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The accept loop and bounded worker pool, generalizing `main.py`'s
//! `ThreadPoolExecutor(max_workers=max_threads)` / `executor.submit`
//! pattern: one OS thread per connection, running a `Session` to
//! completion, with accepts simply queuing once the pool is saturated.

use std::net::TcpListener;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::dispatcher::Dispatcher;
use crate::session::Session;

struct Admission {
    available: Mutex<usize>,
    freed: Condvar,
}

impl Admission {
    fn new(max_threads: usize) -> Admission {
        Admission {
            available: Mutex::new(max_threads),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.freed.wait(available).unwrap();
        }
        *available -= 1;
    }

    fn release(&self) {
        let mut available = self.available.lock().unwrap();
        *available += 1;
        self.freed.notify_one();
    }
}

pub struct Broker {
    dispatcher: Arc<Dispatcher>,
    admission: Arc<Admission>,
    keep_alive: i64,
}

impl Broker {
    pub fn new(max_threads: usize, keep_alive: i64) -> Broker {
        Broker {
            dispatcher: Arc::new(Dispatcher::new()),
            admission: Arc::new(Admission::new(max_threads)),
            keep_alive,
        }
    }

    /// Accepts connections from `listener` forever, handing each one to
    /// a freshly spawned worker thread. Saturation of the pool just
    /// blocks the accept loop until a slot frees up (spec §4.5: "this is
    /// acceptable because the broker provides no admission-control
    /// guarantees").
    pub fn accept_loop(&self, listener: TcpListener) {
        for incoming in listener.incoming() {
            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    continue;
                }
            };

            self.admission.acquire();
            let dispatcher = self.dispatcher.clone();
            let admission = self.admission.clone();
            let keep_alive = self.keep_alive;

            thread::spawn(move || {
                match Session::new(stream, dispatcher, keep_alive) {
                    Ok(session) => session.run(),
                    Err(e) => log::error!("failed to set up session: {}", e),
                }
                admission.release();
            });
        }
    }
}
