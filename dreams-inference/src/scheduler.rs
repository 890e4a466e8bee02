//! Two-lane fork/join scheduler.
//!
//! Two persistent worker threads live for as long as the model does: one computes matmul
//! row ranges, the other attention head ranges. Each call follows the same protocol:
//!
//! 1. the driver hands a [`MatmulTask`] / [`AttentionTask`] descriptor to the lane's signal,
//! 2. it computes its own static half inline (upper rows / upper heads),
//! 3. it waits on the lane's [`Rendezvous`] until the worker posted its tag as well.
//!
//! The split is a fixed 50/50 one: there is no work stealing and only one call is in
//! flight per lane, so the single descriptor slot always has exactly one writer.

use std::io;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::layers::{AttentionShape, attend};
use crate::tensor::matmul_rows;

const DRIVER_TAG: u8 = 1 << 0;
const WORKER_TAG: u8 = 1 << 1;
const ALL_TAGS: u8 = DRIVER_TAG | WORKER_TAG;

/// Two-party barrier where each side posts its own tag bit.
///
/// The barrier releases once both tags are set, then clears them for the next round.
#[derive(Debug, Default)]
pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct RendezvousState {
    posted: u8,
    round: u64,
    worker_failed: bool,
    last_round_failed: bool,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts `tag` and blocks until the other party has posted too.
    ///
    /// Returns `true` when the worker reported a failure during the round just released.
    fn arrive(&self, tag: u8, failed: bool) -> bool {
        let mut state = self.state.lock();
        debug_assert_eq!(state.posted & tag, 0, "tag {tag:#b} posted twice in one round");

        state.posted |= tag;
        state.worker_failed |= failed;

        if state.posted == ALL_TAGS {
            state.posted = 0;
            state.round = state.round.wrapping_add(1);
            state.last_round_failed = std::mem::take(&mut state.worker_failed);
            self.released.notify_all();
        } else {
            let round = state.round;
            while state.round == round {
                self.released.wait(&mut state);
            }
        }

        state.last_round_failed
    }

    /// Number of completed rounds.
    pub fn rounds(&self) -> u64 {
        self.state.lock().round
    }
}

enum Message<T> {
    Run(T),
    Shutdown,
}

/// Binary signal carrying the descriptor for the next dispatch.
struct Signal<T> {
    slot: Mutex<Option<Message<T>>>,
    ready: Condvar,
}

impl<T> Signal<T> {
    fn new() -> Self {
        Self { slot: Mutex::new(None), ready: Condvar::new() }
    }

    fn give(&self, message: Message<T>) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "descriptor slot overwritten before the worker took it");
        *slot = Some(message);
        self.ready.notify_one();
    }

    fn take(&self) -> Message<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(message) = slot.take() {
                return message;
            }
            self.ready.wait(&mut slot);
        }
    }
}

/// Work a lane can run on behalf of the driver.
pub trait Task: Send + 'static {
    fn run(self);
}

/// One persistent worker thread plus its signal and rendezvous.
struct Lane<T: Task> {
    name: &'static str,
    signal: Arc<Signal<T>>,
    rendezvous: Arc<Rendezvous>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Task> Lane<T> {
    fn spawn(name: &'static str) -> io::Result<Self> {
        let signal = Arc::new(Signal::new());
        let rendezvous = Arc::new(Rendezvous::new());

        let handle = {
            let signal = Arc::clone(&signal);
            let rendezvous = Arc::clone(&rendezvous);
            thread::Builder::new().name(name.to_string()).spawn(move || worker_loop(&signal, &rendezvous))?
        };

        debug!("Started worker lane {name}");

        Ok(Self { name, signal, rendezvous, handle: Some(handle) })
    }

    /// Releases the worker with `task`; the returned guard must be joined before the
    /// borrowed buffers behind the descriptor are touched again.
    fn fork(&self, task: T) -> JoinGuard<'_, T> {
        self.signal.give(Message::Run(task));
        JoinGuard { lane: self, joined: false }
    }
}

impl<T: Task> Drop for Lane<T> {
    fn drop(&mut self) {
        self.signal.give(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        debug!("Stopped worker lane {}", self.name);
    }
}

fn worker_loop<T: Task>(signal: &Signal<T>, rendezvous: &Rendezvous) {
    loop {
        match signal.take() {
            Message::Run(task) => {
                let failed = panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err();
                rendezvous.arrive(WORKER_TAG, failed);
            }
            Message::Shutdown => break,
        }
    }
}

/// Driver side of one dispatch. Dropping it without `join` still waits for the worker,
/// so a panic on the driver never leaves the worker writing into freed buffers.
#[must_use = "the worker must be joined before its buffers are reused"]
struct JoinGuard<'a, T: Task> {
    lane: &'a Lane<T>,
    joined: bool,
}

impl<T: Task> JoinGuard<'_, T> {
    fn join(mut self) {
        self.joined = true;
        if self.lane.rendezvous.arrive(DRIVER_TAG, false) {
            panic!("worker lane {} panicked", self.lane.name);
        }
    }
}

impl<T: Task> Drop for JoinGuard<'_, T> {
    fn drop(&mut self) {
        if !self.joined {
            self.lane.rendezvous.arrive(DRIVER_TAG, false);
        }
    }
}

/// Read-only slice smuggled across the lane boundary.
#[derive(Debug, Clone, Copy)]
struct SharedSlice {
    ptr: *const f32,
    len: usize,
}

/// Mutable slice smuggled across the lane boundary.
#[derive(Debug)]
struct SharedSliceMut {
    ptr: *mut f32,
    len: usize,
}

// SAFETY: the slices are only dereferenced by the worker between `fork` and the rendezvous,
// while the driver keeps the original borrows alive and does not touch the mutable halves.
unsafe impl Send for SharedSlice {}
unsafe impl Send for SharedSliceMut {}

impl SharedSlice {
    fn new(slice: &[f32]) -> Self {
        Self { ptr: slice.as_ptr(), len: slice.len() }
    }

    /// # Safety
    /// The source borrow must outlive the returned slice.
    unsafe fn get<'a>(self) -> &'a [f32] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl SharedSliceMut {
    fn new(slice: &mut [f32]) -> Self {
        Self { ptr: slice.as_mut_ptr(), len: slice.len() }
    }

    /// # Safety
    /// The source borrow must outlive the returned slice and nobody else may access it.
    unsafe fn get<'a>(self) -> &'a mut [f32] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Descriptor for the worker's rows of a matrix-vector product.
#[derive(Debug)]
pub struct MatmulTask {
    out: SharedSliceMut,
    x: SharedSlice,
    w: SharedSlice,
}

impl Task for MatmulTask {
    fn run(self) {
        // SAFETY: see `SharedSlice`; the driver is blocked in `JoinGuard::join` or works on
        // the disjoint upper half of `out`.
        unsafe { matmul_rows(self.out.get(), self.x.get(), self.w.get()) }
    }
}

/// Descriptor for the worker's heads of one multi-head attention call.
#[derive(Debug)]
pub struct AttentionTask {
    heads: Range<usize>,
    query: SharedSlice,
    keys: SharedSlice,
    values: SharedSlice,
    scores: SharedSliceMut,
    output: SharedSliceMut,
    shape: AttentionShape,
}

impl Task for AttentionTask {
    fn run(self) {
        // SAFETY: as for `MatmulTask`; `scores` and `output` cover only the worker's heads.
        unsafe {
            attend(
                self.heads,
                self.query.get(),
                self.keys.get(),
                self.values.get(),
                self.scores.get(),
                self.output.get(),
                &self.shape,
            )
        }
    }
}

/// The persistent pair of worker lanes used by the forward pass.
pub struct ForkJoin {
    matmul: Lane<MatmulTask>,
    attention: Lane<AttentionTask>,
}

impl ForkJoin {
    pub fn new() -> io::Result<Self> {
        Ok(Self { matmul: Lane::spawn("matmul-lane")?, attention: Lane::spawn("attention-lane")? })
    }

    /// `out = W · x` where `w` holds `out.len()` rows of `x.len()` columns.
    ///
    /// The worker takes rows `[0, d/2)`, the driver rows `[d/2, d)`. Every row goes through
    /// [`matmul_rows`], so the result is bit-identical to a serial multiplication.
    pub fn matmul(&self, out: &mut [f32], x: &[f32], w: &[f32]) {
        let n = x.len();
        let half = out.len() / 2;
        assert_eq!(w.len(), out.len() * n, "weight slice does not match {} rows of {n} columns", out.len());

        let (out_lo, out_hi) = out.split_at_mut(half);
        let (w_lo, w_hi) = w.split_at(half * n);

        let guard = self.matmul.fork(MatmulTask {
            out: SharedSliceMut::new(out_lo),
            x: SharedSlice::new(x),
            w: SharedSlice::new(w_lo),
        });
        matmul_rows(out_hi, x, w_hi);
        guard.join();
    }

    /// Multi-head attention over all heads of `query`.
    ///
    /// `scores` holds `seq_len` floats per head and `output` `head_size` floats per head;
    /// the worker takes heads `[0, heads/2)`, the driver `[heads/2, heads)`.
    pub fn attention(
        &self,
        query: &[f32],
        keys: &[f32],
        values: &[f32],
        scores: &mut [f32],
        output: &mut [f32],
        shape: &AttentionShape,
    ) {
        let n_heads = query.len() / shape.head_size;
        let half = n_heads / 2;
        assert_eq!(scores.len(), n_heads * shape.seq_len);
        assert_eq!(output.len(), n_heads * shape.head_size);

        let (scores_lo, scores_hi) = scores.split_at_mut(half * shape.seq_len);
        let (output_lo, output_hi) = output.split_at_mut(half * shape.head_size);

        let guard = self.attention.fork(AttentionTask {
            heads: 0..half,
            query: SharedSlice::new(query),
            keys: SharedSlice::new(keys),
            values: SharedSlice::new(values),
            scores: SharedSliceMut::new(scores_lo),
            output: SharedSliceMut::new(output_lo),
            shape: *shape,
        });
        attend(half..n_heads, query, keys, values, scores_hi, output_hi, shape);
        guard.join();
    }

    /// Completed (matmul, attention) dispatches since start-up.
    pub fn dispatches(&self) -> (u64, u64) {
        (self.matmul.rendezvous.rounds(), self.attention.rendezvous.rounds())
    }
}

impl std::fmt::Debug for ForkJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (matmuls, attentions) = self.dispatches();
        f.debug_struct("ForkJoin").field("matmuls", &matmuls).field("attentions", &attentions).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / 16_777_216.0 - 0.5
            })
            .collect()
    }

    #[test]
    fn forked_matmul_matches_serial_bit_for_bit() {
        let fork_join = ForkJoin::new().unwrap();

        for (d, n) in [(1, 3), (2, 4), (7, 5), (64, 33)] {
            let w = pseudo_random(d * n, d as u32);
            let x = pseudo_random(n, n as u32);

            let mut serial = vec![0.0; d];
            matmul_rows(&mut serial, &x, &w);

            let mut forked = vec![0.0; d];
            fork_join.matmul(&mut forked, &x, &w);

            let serial_bits: Vec<u32> = serial.iter().map(|v| v.to_bits()).collect();
            let forked_bits: Vec<u32> = forked.iter().map(|v| v.to_bits()).collect();
            assert_eq!(serial_bits, forked_bits, "d={d} n={n}");
        }

        assert_eq!(fork_join.dispatches().0, 4);
    }

    #[test]
    fn forked_attention_matches_serial() {
        let fork_join = ForkJoin::new().unwrap();
        let shape = AttentionShape { pos: 3, head_size: 4, kv_dim: 8, kv_mul: 2, seq_len: 6 };
        let n_heads = 4;

        let query = pseudo_random(n_heads * shape.head_size, 1);
        let keys = pseudo_random((shape.pos + 1) * shape.kv_dim, 2);
        let values = pseudo_random((shape.pos + 1) * shape.kv_dim, 3);

        let mut serial_scores = vec![0.0; n_heads * shape.seq_len];
        let mut serial_out = vec![0.0; n_heads * shape.head_size];
        attend(0..n_heads, &query, &keys, &values, &mut serial_scores, &mut serial_out, &shape);

        let mut scores = vec![0.0; n_heads * shape.seq_len];
        let mut out = vec![0.0; n_heads * shape.head_size];
        fork_join.attention(&query, &keys, &values, &mut scores, &mut out, &shape);

        assert_eq!(serial_out, out);
        assert_eq!(serial_scores, scores);
    }

    #[test]
    fn rendezvous_is_reusable_across_rounds() {
        let rendezvous = Arc::new(Rendezvous::new());
        let worker = {
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || {
                for _ in 0..100 {
                    rendezvous.arrive(WORKER_TAG, false);
                }
            })
        };

        for _ in 0..100 {
            assert!(!rendezvous.arrive(DRIVER_TAG, false));
        }
        worker.join().unwrap();

        assert_eq!(rendezvous.rounds(), 100);
    }

    struct Exploding;

    impl Task for Exploding {
        fn run(self) {
            panic!("boom");
        }
    }

    #[test]
    #[should_panic(expected = "worker lane exploding-lane panicked")]
    fn worker_panic_is_raised_on_driver() {
        let lane = Lane::<Exploding>::spawn("exploding-lane").unwrap();
        lane.fork(Exploding).join();
    }
}
