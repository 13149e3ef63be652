// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Arena bookkeeping for the real-time buffers.

Every buffer touched inside the per-block path is handed out here, exactly
once, before block 0 — the hot loop never allocates. The arena does not
share address space between data sets; it accounts for each data set's
reservation (sized from the [`crate::plan::ProcessingPlan`]) and refuses
double or oversized allocations, which would be programmer errors, loudly.
 */

use std::cell::Cell;

use log::debug;

use crate::c32;
use crate::plan::{ProcessingPlan, ProductKind};

struct Reservation {
    kind: ProductKind,
    bytes: usize,
    taken: Cell<bool>,
}

pub struct Arena {
    reservations: Vec<Reservation>,
}

impl Arena {
    /// Reserve one arena per calculated data set, sized from the plan.
    pub fn from_plan(plan: &ProcessingPlan) -> Arena {
        let mut reservations: Vec<Reservation> = plan
            .items()
            .filter(|item| item.calculate)
            .map(|item| Reservation {
                kind: item.kind,
                bytes: item.bytes,
                taken: Cell::new(false),
            })
            .collect();
        reservations.sort_by_key(|r| plan.item(r.kind).arena.unwrap());

        let total: usize = reservations.iter().map(|r| r.bytes).sum();
        debug!(
            "arena: {} reservations, {} bytes total",
            reservations.len(),
            total
        );
        Arena { reservations }
    }

    pub fn total_bytes(&self) -> usize {
        self.reservations.iter().map(|r| r.bytes).sum()
    }

    fn take(&self, kind: ProductKind, bytes: usize) {
        let r = self
            .reservations
            .iter()
            .find(|r| r.kind == kind)
            .unwrap_or_else(|| panic!("no arena reserved for {kind}"));
        // Double allocation or a size mismatch can only come from the
        // allocation code disagreeing with the plan's sizing.
        assert!(!r.taken.get(), "arena for {kind} allocated twice");
        assert!(
            bytes <= r.bytes,
            "{kind} wants {bytes} B but its arena holds {} B",
            r.bytes
        );
        r.taken.set(true);
    }

    /// Allocate the complex-sample buffer for a data set. Called once per
    /// kind, at preprocess time.
    pub fn allocate_c32(&self, kind: ProductKind, len: usize) -> Vec<c32> {
        self.take(kind, len * std::mem::size_of::<c32>());
        vec![c32::default(); len]
    }

    /// As [`Arena::allocate_c32`], for real-valued data sets. The arena's
    /// reservation covers all of a kind's buffers together, so mixed
    /// allocations (samples + weights) must fit the one reservation.
    pub fn allocate_f32(&self, kind: ProductKind, len: usize) -> Vec<f32> {
        self.take(kind, len * std::mem::size_of::<f32>());
        vec![0.0; len]
    }

    /// Weight/valid-count buffers share their data set's reservation;
    /// account for them without re-taking the arena.
    pub fn allocate_u32_extra(&self, kind: ProductKind, len: usize) -> Vec<u32> {
        let r = self
            .reservations
            .iter()
            .find(|r| r.kind == kind)
            .unwrap_or_else(|| panic!("no arena reserved for {kind}"));
        assert!(r.taken.get(), "main buffer for {kind} not allocated yet");
        vec![0; len]
    }
}
