/*
BSD 2-Clause License

Copyright (c) 2022, Diagnosis and Control of Clouds Laboratory
All rights reserved.

Redistribution and use in source and binary forms, with or without
modification, are permitted provided that the following conditions are met:

1. Redistributions of source code must retain the above copyright notice, this
   list of conditions and the following disclaimer.

2. Redistributions in binary form must reproduce the above copyright notice,
   this list of conditions and the following disclaimer in the documentation
   and/or other materials provided with the distribution.

THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

*/

//! Back-pressure gate between producers and the joiner.
//!
//! A watermark buffer: past `high_water_mark` the gate reports *paused* and
//! drops incoming items (with a counter) instead of growing without bound;
//! once drained to `low_water_mark` it resumes. `channel` wraps the gate for
//! cross-thread use, one producer set and one consumer, with the consumer
//! blocking on a condvar while the buffer is empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub high_water_mark: usize,
    pub low_water_mark: usize,
    pub max_buffer_size: usize,
}

impl BackpressureConfig {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        BackpressureConfig {
            high_water_mark: buffer_size,
            low_water_mark: buffer_size / 4,
            max_buffer_size: buffer_size * 2,
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig::with_buffer_size(1_000)
    }
}

/// The single-threaded core of the gate.
pub struct BackpressureGate<T> {
    config: BackpressureConfig,
    buffer: VecDeque<T>,
    paused: bool,
    dropped: u64,
}

impl<T> BackpressureGate<T> {
    pub fn new(config: BackpressureConfig) -> Self {
        BackpressureGate {
            config,
            buffer: VecDeque::new(),
            paused: false,
            dropped: 0,
        }
    }

    /// Offers an item; `false` means it was dropped under pressure.
    pub fn push(&mut self, item: T) -> bool {
        if self.paused || self.buffer.len() >= self.config.max_buffer_size {
            self.dropped += 1;
            return false;
        }
        self.buffer.push_back(item);
        if self.buffer.len() >= self.config.high_water_mark {
            self.paused = true;
        }
        true
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.buffer.pop_front();
        if self.paused && self.buffer.len() <= self.config.low_water_mark {
            self.paused = false;
        }
        item
    }

    /// Upstream should stop producing while this holds.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

struct Shared<T> {
    gate: Mutex<BackpressureGate<T>>,
    available: Condvar,
    senders: AtomicUsize,
    /// Receiver gone; senders drop everything on the floor.
    closed: Mutex<bool>,
    dropped_total: AtomicU64,
}

/// Sending half; clone one per producer thread.
pub struct GateSender<T> {
    shared: Arc<Shared<T>>,
}

/// Receiving half; iterate to drain. `None`/iterator end means every sender
/// is gone and the buffer is empty.
pub struct GateReceiver<T> {
    shared: Arc<Shared<T>>,
}

pub fn channel<T>(config: BackpressureConfig) -> (GateSender<T>, GateReceiver<T>) {
    let shared = Arc::new(Shared {
        gate: Mutex::new(BackpressureGate::new(config)),
        available: Condvar::new(),
        senders: AtomicUsize::new(1),
        closed: Mutex::new(false),
        dropped_total: AtomicU64::new(0),
    });
    (
        GateSender {
            shared: Arc::clone(&shared),
        },
        GateReceiver { shared },
    )
}

impl<T> GateSender<T> {
    /// Non-blocking send under the drop policy; `false` means dropped.
    pub fn send(&self, item: T) -> bool {
        if *self.shared.closed.lock().unwrap() {
            self.shared.dropped_total.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let accepted = {
            let mut gate = self.shared.gate.lock().unwrap();
            gate.push(item)
        };
        if accepted {
            self.shared.available.notify_one();
        } else {
            self.shared.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Whether the gate currently asks producers to hold off.
    pub fn is_paused(&self) -> bool {
        self.shared.gate.lock().unwrap().is_paused()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped_total.load(Ordering::Relaxed)
            + self.shared.gate.lock().unwrap().dropped()
    }
}

impl<T> Clone for GateSender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::SeqCst);
        GateSender {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for GateSender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::SeqCst) == 1 {
            // last sender: wake the receiver so it can see the end
            self.shared.available.notify_all();
        }
    }
}

impl<T> GateReceiver<T> {
    /// Blocks until an item arrives or all senders hang up.
    pub fn recv(&self) -> Option<T> {
        let mut gate = self.shared.gate.lock().unwrap();
        loop {
            if let Some(item) = gate.pop() {
                return Some(item);
            }
            if self.shared.senders.load(Ordering::SeqCst) == 0 {
                return None;
            }
            gate = self.shared.available.wait(gate).unwrap();
        }
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped_total.load(Ordering::Relaxed)
            + self.shared.gate.lock().unwrap().dropped()
    }
}

impl<T> Drop for GateReceiver<T> {
    fn drop(&mut self) {
        *self.shared.closed.lock().unwrap() = true;
        // unblock nothing in particular; senders check the flag on send
        self.shared.available.notify_all();
    }
}

impl<T> Iterator for GateReceiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(low: usize, high: usize, max: usize) -> BackpressureConfig {
        BackpressureConfig {
            low_water_mark: low,
            high_water_mark: high,
            max_buffer_size: max,
        }
    }

    #[test]
    fn pauses_at_high_watermark() {
        let mut gate = BackpressureGate::new(config(1, 3, 10));
        assert!(gate.push(1));
        assert!(gate.push(2));
        assert!(!gate.is_paused());
        assert!(gate.push(3));
        assert!(gate.is_paused());
        // paused: further pushes drop
        assert!(!gate.push(4));
        assert_eq!(gate.dropped(), 1);
        assert_eq!(gate.len(), 3);
    }

    #[test]
    fn resumes_at_low_watermark() {
        let mut gate = BackpressureGate::new(config(1, 3, 10));
        for i in 0..3 {
            gate.push(i);
        }
        assert!(gate.is_paused());
        assert_eq!(gate.pop(), Some(0));
        assert!(gate.is_paused());
        assert_eq!(gate.pop(), Some(1));
        // len == 1 == low watermark: resumed
        assert!(!gate.is_paused());
        assert!(gate.push(10));
    }

    #[test]
    fn hard_cap_drops_even_when_not_paused() {
        // degenerate config where max < high
        let mut gate = BackpressureGate::new(config(0, 10, 2));
        assert!(gate.push(1));
        assert!(gate.push(2));
        assert!(!gate.push(3));
        assert_eq!(gate.dropped(), 1);
    }

    #[test]
    fn drains_in_fifo_order() {
        let mut gate = BackpressureGate::new(BackpressureConfig::default());
        for i in 0..5 {
            gate.push(i);
        }
        let drained: Vec<i32> = std::iter::from_fn(|| gate.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn channel_moves_items_across_threads() {
        let (tx, rx) = channel::<u32>(BackpressureConfig::default());
        let producer = thread::spawn(move || {
            for i in 0..100 {
                tx.send(i);
            }
        });
        let received: Vec<u32> = rx.collect();
        producer.join().unwrap();
        assert_eq!(received.len(), 100);
        assert_eq!(received[0], 0);
        assert_eq!(received[99], 99);
    }

    #[test]
    fn channel_ends_when_all_senders_drop() {
        let (tx, rx) = channel::<u32>(BackpressureConfig::default());
        let tx2 = tx.clone();
        tx.send(1);
        drop(tx);
        tx2.send(2);
        drop(tx2);
        let received: Vec<u32> = rx.collect();
        assert_eq!(received, vec![1, 2]);
    }

    #[test]
    fn channel_drops_past_high_watermark() {
        let (tx, rx) = channel::<u32>(config(1, 4, 8));
        for i in 0..10 {
            tx.send(i);
        }
        assert!(tx.is_paused());
        assert!(tx.dropped() >= 6);
        drop(tx);
        let received: Vec<u32> = rx.collect();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[test]
    fn sends_after_receiver_drop_are_dropped() {
        let (tx, rx) = channel::<u32>(BackpressureConfig::default());
        drop(rx);
        assert!(!tx.send(1));
        assert_eq!(tx.dropped(), 1);
    }
}
