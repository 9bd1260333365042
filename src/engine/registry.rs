//! Bookkeeping for submitted requests.
//!
//! Every outstanding request is one [`Submission`] in a slab. The pending,
//! pending-wrapped and reaped views of the registry are indexes over that
//! slab, so a request can only ever be in one stage.
//!
//! Fragments the kernel may hold live in the pending index. A fragment that
//! is being discarded is pinned there, and it stays allocated until the
//! discard call has returned even if the kernel hands it back first, so its
//! address cannot be reused while a discard for it is in progress.

use std::{
    collections::{HashMap, VecDeque},
    ffi::c_int,
    mem,
    sync::Arc,
};

use slab::Slab;

use crate::{
    platform::{urb_status, Fragment, RawUrb},
    transfer::{Direction, Notify, Urb, UrbHandle, UrbKind, SETUP_PACKET_SIZE},
    Error, ErrorKind, UrbStatus,
};

/// Identity of a fragment while the kernel holds it, stored in the URB's
/// `usercontext` field.
pub(crate) type Token = usize;

/// Stable reference to a submission. The generation distinguishes a reused
/// slab slot from the submission that used to live there.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SubmissionId {
    key: usize,
    generation: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SubmissionKind {
    /// Submitted by the caller, reaped through `reap_any` / `reap_specific`.
    Async,

    /// Submitted on behalf of a blocking `process_control`.
    SyncWrapControl,

    /// Submitted on behalf of a blocking `process_bulk`.
    SyncWrapBulk,

    /// Default-endpoint standard request executed on a worker thread with
    /// the synchronous control ioctl; no URB is ever submitted.
    NoNativeRepresentation,
}

impl SubmissionKind {
    /// Results of private submissions are only handed to the shim waiting
    /// for them, never to `reap_any`.
    fn is_private(self) -> bool {
        matches!(
            self,
            SubmissionKind::SyncWrapControl | SubmissionKind::SyncWrapBulk
        )
    }
}

enum Slot {
    /// Owned by the pending index under this token.
    InFlight(Token),

    /// Reaped; the fragment is back with its submission.
    Done(Fragment),

    /// Resolved without the kernel's answer, by cancel or disconnect.
    Detached(UrbStatus),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Stage {
    Pending,
    Reaped,
}

pub(crate) struct Submission {
    generation: u64,
    urb: Urb,
    kind: SubmissionKind,
    private: bool,
    slots: Vec<Slot>,
    remaining: usize,
    zombie: bool,
    stage: Stage,
    signal: Option<Arc<Notify>>,
}

struct InFlight {
    /// `None` once the submission gave up on this fragment; the fragment is
    /// then freed when the kernel returns it.
    owner: Option<(SubmissionId, usize)>,
    fragment: Fragment,
    pins: u32,
}

/// Fragments to discard outside the lock. Pass back to
/// [`Registry::unpin`] once the discard calls returned.
pub(crate) type Pinned = Vec<(Token, *mut RawUrb)>;

/// Outcome of folding a completion into the registry.
pub(crate) enum Completion {
    /// No fragment with this token is known.
    Unknown,

    /// The fragment belonged to no submission any more. It is freed, or
    /// parked until the discard that pinned it returns.
    Orphan,

    /// More fragments of the submission are outstanding.
    Partial,

    /// The submission was forgotten and its result dropped.
    Discarded(UrbHandle),

    /// The submission moved to the reaped FIFO.
    Reaped {
        handle: UrbHandle,
        signal: Option<Arc<Notify>>,
        private: bool,
    },
}

impl Completion {
    /// Wake whoever waits for this completion. Returns `true` if waiters on
    /// the shared completion signal need to be woken.
    pub(crate) fn notify(&self) -> bool {
        match self {
            Completion::Reaped {
                signal, private, ..
            } => {
                if let Some(signal) = signal {
                    signal.notify();
                }
                !private
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    submissions: Slab<Submission>,
    by_handle: HashMap<UrbHandle, usize>,
    pending: HashMap<Token, InFlight>,
    returned: HashMap<Token, InFlight>,
    reaped: VecDeque<usize>,
    next_token: Token,
    next_generation: u64,
}

impl Registry {
    fn get_mut(&mut self, id: SubmissionId) -> Option<&mut Submission> {
        self.submissions
            .get_mut(id.key)
            .filter(|s| s.generation == id.generation)
    }

    fn id_of(&self, key: usize) -> SubmissionId {
        SubmissionId {
            key,
            generation: self.submissions[key].generation,
        }
    }

    fn alloc_token(&mut self) -> Token {
        loop {
            self.next_token = self.next_token.wrapping_add(1);
            // 0 would read back as a null `usercontext`
            if self.next_token != 0
                && !self.pending.contains_key(&self.next_token)
                && !self.returned.contains_key(&self.next_token)
            {
                return self.next_token;
            }
        }
    }

    fn insert(
        &mut self,
        urb: Urb,
        kind: SubmissionKind,
        remaining: usize,
        signal: Option<Arc<Notify>>,
    ) -> Result<SubmissionId, Error> {
        if self.by_handle.contains_key(&urb.handle) {
            return Err(Error::new(
                ErrorKind::Busy,
                "a request with this handle is already outstanding",
            ));
        }
        let handle = urb.handle;
        self.next_generation += 1;
        let generation = self.next_generation;
        let key = self.submissions.insert(Submission {
            generation,
            urb,
            kind,
            private: kind.is_private(),
            slots: Vec::with_capacity(remaining),
            remaining,
            zombie: false,
            stage: Stage::Pending,
            signal,
        });
        self.by_handle.insert(handle, key);
        Ok(SubmissionId { key, generation })
    }

    /// Register a request and its fragments. The fragments move into the
    /// pending index; the returned URB pointers are to be submitted in order.
    pub(crate) fn insert_native(
        &mut self,
        urb: Urb,
        kind: SubmissionKind,
        fragments: Vec<Fragment>,
        signal: Option<Arc<Notify>>,
    ) -> Result<(SubmissionId, Vec<(Token, *mut RawUrb)>), Error> {
        let id = self.insert(urb, kind, fragments.len(), signal)?;

        let mut urbs = Vec::with_capacity(fragments.len());
        for (index, mut fragment) in fragments.into_iter().enumerate() {
            let token = self.alloc_token();
            let ptr = fragment.arm(token);
            self.pending.insert(
                token,
                InFlight {
                    owner: Some((id, index)),
                    fragment,
                    pins: 0,
                },
            );
            self.submissions[id.key].slots.push(Slot::InFlight(token));
            urbs.push((token, ptr));
        }
        Ok((id, urbs))
    }

    /// Register a request that is executed without a URB. Its buffer is
    /// handed out to the worker and comes back in [`Self::complete_wrapped`].
    ///
    /// A `private` request is only handed to the caller blocked on `signal`.
    pub(crate) fn insert_wrapped(
        &mut self,
        mut urb: Urb,
        signal: Option<Arc<Notify>>,
        private: bool,
    ) -> Result<(SubmissionId, Vec<u8>), Error> {
        let buffer = mem::take(&mut urb.buffer);
        let id = self.insert(urb, SubmissionKind::NoNativeRepresentation, 1, signal)?;
        self.submissions[id.key].private = private;
        Ok((id, buffer))
    }

    /// Undo a partially failed submission.
    ///
    /// Fragments the kernel never saw are dropped. Accepted fragments are
    /// detached and returned pinned, to be discarded; they stay in the
    /// pending index until the kernel returns them.
    pub(crate) fn unwind_submit(
        &mut self,
        id: SubmissionId,
        accepted: &[(Token, *mut RawUrb)],
        rejected: &[(Token, *mut RawUrb)],
    ) -> Pinned {
        for &(token, _) in rejected {
            // A concurrent cancel may be discarding it; leave it to `unpin`.
            if let Some(entry) = self.pending.remove(&token) {
                if entry.pins > 0 {
                    self.returned.insert(token, entry);
                }
            }
        }

        let pinned = accepted
            .iter()
            .filter_map(|&(token, _)| self.detach(token))
            .collect();

        if self.get_mut(id).is_some() {
            self.remove(id.key);
        }
        pinned
    }

    /// Take a fragment away from its submission and pin it for a discard.
    fn detach(&mut self, token: Token) -> Option<(Token, *mut RawUrb)> {
        let entry = self.pending.get_mut(&token)?;
        entry.owner = None;
        entry.pins += 1;
        Some((token, entry.fragment.urb_ptr()))
    }

    /// Release fragments pinned by [`Self::cancel`] or
    /// [`Self::unwind_submit`]. Those the kernel already returned are freed.
    pub(crate) fn unpin(&mut self, pinned: &Pinned) {
        for (token, _) in pinned {
            if let Some(entry) = self.pending.get_mut(token) {
                entry.pins -= 1;
            } else if let Some(entry) = self.returned.get_mut(token) {
                entry.pins -= 1;
                if entry.pins == 0 {
                    self.returned.remove(token);
                }
            }
        }
    }

    fn remove(&mut self, key: usize) -> Submission {
        let sub = self.submissions.remove(key);
        self.by_handle.remove(&sub.urb.handle);
        if sub.stage == Stage::Reaped {
            self.reaped.retain(|&k| k != key);
        }
        sub
    }

    /// Mark a submission whose countdown reached zero as complete.
    fn finish(&mut self, key: usize) -> Completion {
        let sub = &mut self.submissions[key];
        debug_assert_eq!(sub.remaining, 0);
        let handle = sub.urb.handle;
        if sub.zombie {
            self.remove(key);
            return Completion::Discarded(handle);
        }
        sub.stage = Stage::Reaped;
        let completion = Completion::Reaped {
            handle,
            signal: sub.signal.clone(),
            private: sub.private,
        };
        self.reaped.push_back(key);
        completion
    }

    /// Fold a fragment returned by the kernel into its submission.
    pub(crate) fn complete_fragment(&mut self, token: Token) -> Completion {
        let Some(entry) = self.pending.remove(&token) else {
            return Completion::Unknown;
        };
        let Some((id, index)) = entry.owner else {
            if entry.pins > 0 {
                self.returned.insert(token, entry);
            }
            return Completion::Orphan;
        };
        let Some(sub) = self.get_mut(id) else {
            log::error!("Fragment {token} refers to a submission that no longer exists");
            return Completion::Orphan;
        };

        sub.slots[index] = Slot::Done(entry.fragment);
        sub.remaining -= 1;
        if sub.remaining > 0 {
            return Completion::Partial;
        }
        self.finish(id.key)
    }

    /// Store the result of a request executed by the default-endpoint worker.
    pub(crate) fn complete_wrapped(
        &mut self,
        id: SubmissionId,
        buffer: Vec<u8>,
        status: UrbStatus,
        actual_len: usize,
    ) -> Completion {
        let Some(sub) = self.get_mut(id) else {
            return Completion::Unknown;
        };
        sub.urb.buffer = buffer;
        sub.urb.status = status;
        sub.urb.actual_len = actual_len.min(sub.urb.buffer.len());
        sub.remaining = 0;
        self.finish(id.key)
    }

    /// Remove the oldest reaped submission that is not private to a
    /// synchronous shim.
    pub(crate) fn pop_any(&mut self) -> Option<Submission> {
        let pos = self
            .reaped
            .iter()
            .position(|&key| !self.submissions[key].private)?;
        let key = self.reaped.remove(pos)?;
        let sub = self.submissions.remove(key);
        self.by_handle.remove(&sub.urb.handle);
        Some(sub)
    }

    /// Remove the reaped submission for `handle`, if it has been reaped.
    pub(crate) fn take(&mut self, handle: UrbHandle) -> Option<Submission> {
        let key = *self.by_handle.get(&handle)?;
        if self.submissions[key].stage != Stage::Reaped {
            return None;
        }
        Some(self.remove(key))
    }

    /// Resolve a pending request immediately.
    ///
    /// Outstanding fragments are detached from the submission, which
    /// completes with whatever the reaped fragments delivered. The detached
    /// fragments are returned pinned, to be discarded.
    pub(crate) fn cancel(&mut self, handle: UrbHandle) -> Result<(Completion, Pinned), Error> {
        let key = *self.by_handle.get(&handle).ok_or_else(not_submitted)?;
        let sub = &self.submissions[key];

        if sub.stage == Stage::Reaped {
            return Ok((Completion::Partial, Vec::new()));
        }
        if sub.kind == SubmissionKind::NoNativeRepresentation {
            return if sub.zombie {
                Ok((Completion::Partial, Vec::new()))
            } else {
                Err(Error::new(
                    ErrorKind::Busy,
                    "a default control endpoint request cannot be cancelled",
                ))
            };
        }

        let mut pinned = Vec::new();
        for index in 0..sub.slots.len() {
            let Slot::InFlight(token) = self.submissions[key].slots[index] else {
                continue;
            };
            pinned.extend(self.detach(token));
            self.submissions[key].slots[index] = Slot::Detached(UrbStatus::Cancelled);
        }

        self.submissions[key].remaining = 0;
        Ok((self.finish(key), pinned))
    }

    /// Stop caring about a request's result.
    pub(crate) fn forget(&mut self, handle: UrbHandle) -> Result<(), Error> {
        let key = *self.by_handle.get(&handle).ok_or_else(not_submitted)?;
        let sub = &mut self.submissions[key];
        match sub.stage {
            Stage::Reaped => {
                self.remove(key);
            }
            Stage::Pending => sub.zombie = true,
        }
        Ok(())
    }

    /// Resolve every native submission after the device went away. The
    /// kernel will not return their outstanding fragments; those stay parked
    /// in the pending index until the registry is dropped.
    pub(crate) fn drain_disconnected(&mut self) -> Vec<Completion> {
        let keys: Vec<usize> = self
            .submissions
            .iter()
            .filter(|(_, s)| {
                s.stage == Stage::Pending && s.kind != SubmissionKind::NoNativeRepresentation
            })
            .map(|(key, _)| key)
            .collect();

        let mut completions = Vec::new();
        for key in keys {
            let id = self.id_of(key);
            for entry in self.pending.values_mut() {
                if let Some((owner, index)) = entry.owner {
                    if owner == id {
                        entry.owner = None;
                        self.submissions[key].slots[index] =
                            Slot::Detached(UrbStatus::Disconnected);
                    }
                }
            }
            self.submissions[key].remaining = 0;
            completions.push(self.finish(key));
        }
        completions
    }

    /// Number of submissions in any stage.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.submissions.len()
    }

    /// Number of fragments still allocated for the kernel's sake.
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len() + self.returned.len()
    }
}

fn not_submitted() -> Error {
    Error::new(ErrorKind::NotSubmitted, "request was not submitted")
}

impl Submission {
    /// Copy the kernel's results back into the request.
    ///
    /// The status is the first non-successful fragment status in submission
    /// order; errors reported by later fragments are not surfaced.
    pub(crate) fn into_urb(self) -> Urb {
        let mut urb = self.urb;
        if self.kind == SubmissionKind::NoNativeRepresentation {
            return urb;
        }

        let direction = urb.direction();
        let mut status = None;
        let mut note = |s: UrbStatus| {
            if status.is_none() && s != UrbStatus::Complete {
                status = Some(s);
            }
        };

        if let UrbKind::Isochronous(packets) = &mut urb.kind {
            let mut actual = 0;
            let mut error_count = 0;
            let mut detached = None;
            for slot in &self.slots {
                match slot {
                    Slot::Done(f) => {
                        for (i, desc) in f.iso_packets().iter().enumerate() {
                            if let Some(p) = packets.get_mut(f.first_packet() + i) {
                                p.actual_length = desc.actual_length;
                                p.status = urb_status(desc.status as c_int);
                                actual += desc.actual_length as usize;
                            }
                        }
                        if direction == Direction::In {
                            let len = f.request_len();
                            let end = (f.offset() + len).min(urb.buffer.len());
                            urb.buffer[f.offset()..end]
                                .copy_from_slice(&f.buffer()[..end - f.offset()]);
                        }
                        error_count += f.error_count();
                        note(f.status());
                    }
                    Slot::Detached(s) => {
                        detached.get_or_insert(*s);
                        note(*s);
                    }
                    Slot::InFlight(_) => note(UrbStatus::Pending),
                }
            }
            if let Some(s) = detached {
                for p in packets.iter_mut().filter(|p| p.status == UrbStatus::Pending) {
                    p.status = s;
                }
            }
            urb.error_count = error_count;
            urb.actual_len = match direction {
                Direction::In => urb.buffer.len(),
                Direction::Out => actual,
            };
        } else {
            let skip = match urb.kind {
                UrbKind::Control(_) => SETUP_PACKET_SIZE,
                _ => 0,
            };
            let mut actual = 0;
            for slot in &self.slots {
                match slot {
                    Slot::Done(f) => {
                        let len = f.actual_len();
                        if direction == Direction::In && actual < urb.buffer.len() {
                            let src = f.buffer().get(skip..).unwrap_or_default();
                            let n = len.min(urb.buffer.len() - actual).min(src.len());
                            urb.buffer[actual..actual + n].copy_from_slice(&src[..n]);
                        }
                        actual += len;
                        note(f.status());
                    }
                    Slot::Detached(s) => note(*s),
                    Slot::InFlight(_) => note(UrbStatus::Pending),
                }
            }
            urb.actual_len = actual.min(urb.buffer.len());
        }

        urb.status = status.unwrap_or(UrbStatus::Complete);
        urb
    }
}

#[cfg(test)]
fn default_control(handle: u64) -> Urb {
    use crate::transfer::{ControlSetup, ControlType, Recipient};
    let setup = ControlSetup::new(
        Direction::In,
        ControlType::Standard,
        Recipient::Device,
        0x06,
        0x0100,
        0,
        18,
    );
    Urb::control(UrbHandle(handle), setup, &[])
}

#[test]
fn wrapped_request_cannot_be_cancelled() {
    let mut registry = Registry::default();
    let (id, buffer) = registry.insert_wrapped(default_control(1), None, false).unwrap();
    assert_eq!(buffer.len(), 18);

    let err = registry.cancel(UrbHandle(1)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Busy);

    // Once forgotten, cancel is a no-op and the result is dropped on completion.
    registry.forget(UrbHandle(1)).unwrap();
    assert!(registry.cancel(UrbHandle(1)).unwrap().1.is_empty());
    assert!(matches!(
        registry.complete_wrapped(id, buffer, UrbStatus::Complete, 18),
        Completion::Discarded(UrbHandle(1))
    ));
    assert_eq!(registry.len(), 0);
}

#[test]
fn wrapped_completion_is_reaped_in_order() {
    let mut registry = Registry::default();
    let (a, buf_a) = registry.insert_wrapped(default_control(1), None, false).unwrap();
    let (b, buf_b) = registry.insert_wrapped(default_control(2), None, false).unwrap();

    registry.complete_wrapped(b, buf_b, UrbStatus::Stall, 0);
    registry.complete_wrapped(a, buf_a, UrbStatus::Complete, 4);

    let first = registry.pop_any().unwrap().into_urb();
    assert_eq!(first.handle, UrbHandle(2));
    assert_eq!(first.status, UrbStatus::Stall);
    let second = registry.pop_any().unwrap().into_urb();
    assert_eq!(second.handle, UrbHandle(1));
    assert_eq!(second.actual_len, 4);
    assert_eq!(second.requested_len(), 18);
    assert!(registry.pop_any().is_none());
}

#[test]
fn private_submissions_hidden_from_pop_any() {
    use crate::platform::fragment_urb;

    let mut registry = Registry::default();
    let urb = Urb::bulk_in(UrbHandle(3), 0x81, 64);
    let fragments = fragment_urb(&urb, 1024).unwrap();
    let (_, urbs) = registry
        .insert_native(urb, SubmissionKind::SyncWrapBulk, fragments, None)
        .unwrap();
    assert_eq!(urbs.len(), 1);

    let (token, _) = urbs[0];
    assert!(matches!(
        registry.complete_fragment(token),
        Completion::Reaped { private: true, .. }
    ));
    assert!(registry.pop_any().is_none());
    assert!(registry.take(UrbHandle(3)).is_some());
    assert_eq!(registry.in_flight(), 0);
}

#[test]
fn unknown_handle_not_submitted() {
    let mut registry = Registry::default();
    assert_eq!(
        registry.forget(UrbHandle(9)).unwrap_err().kind(),
        ErrorKind::NotSubmitted
    );
    assert!(registry.take(UrbHandle(9)).is_none());
}

#[test]
fn private_wrapped_request_hidden_from_pop_any() {
    let mut registry = Registry::default();
    let (id, buffer) = registry.insert_wrapped(default_control(4), None, true).unwrap();
    assert!(matches!(
        registry.complete_wrapped(id, buffer, UrbStatus::Complete, 18),
        Completion::Reaped { private: true, .. }
    ));
    assert!(registry.pop_any().is_none());
    assert_eq!(registry.take(UrbHandle(4)).unwrap().into_urb().actual_len, 18);
}
