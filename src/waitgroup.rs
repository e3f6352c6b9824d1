/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A counter that lets one thread wait for a dynamic set of tasks to finish. Nodes use it to
//! drain in-flight broadcasts before shutting down.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<i64>,
    zero: Condvar,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        WaitGroup::default()
    }

    pub fn add(&self, n: u64) {
        let mut count = self.count.lock().unwrap();
        *count += n as i64;
    }

    /// Mark one task finished. Panics if called more times than [add](Self::add) accounted for.
    pub fn done(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count < 0 {
            panic!("WaitGroup: done() called more times than add()");
        }
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Block until the counter reaches zero. Returns immediately if it already is.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.zero.wait(count).unwrap();
        }
    }
}
