//! Create/update/delete/skip/fail computation for the pull sync path.
use std::collections::{HashMap, HashSet};

use crate::model::ShiftRecord;

/// An entity that can be matched across passes by its WFM-side identity.
pub trait WfmEntity: Clone {
    fn wfm_id(&self) -> &str;

    /// True when nothing the front end shows has changed.
    fn same_content(&self, other: &Self) -> bool;

    /// Copy locally assigned fields from the cached version onto a fresh one.
    fn carry_over(&mut self, _previous: &Self) {}
}

impl WfmEntity for ShiftRecord {
    fn wfm_id(&self) -> &str {
        &self.wfm_id
    }

    fn same_content(&self, other: &Self) -> bool {
        self.wfm_employee_id == other.wfm_employee_id
            && self.start == other.start
            && self.end == other.end
            && self.quantity == other.quantity
            && self.department == other.department
    }

    fn carry_over(&mut self, previous: &Self) {
        self.frontend_id = previous.frontend_id.clone();
        if self.frontend_employee_id.is_empty() {
            self.frontend_employee_id = previous.frontend_employee_id.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaSet<T> {
    pub created: Vec<T>,
    pub updated: Vec<T>,
    pub deleted: Vec<T>,
    pub skipped: Vec<T>,
    pub failed: Vec<T>,
    /// Set when capping left work for the next pass.
    pub has_more: bool,
}

impl<T> Default for DeltaSet<T> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            has_more: false,
        }
    }
}

impl<T: WfmEntity> DeltaSet<T> {
    /// Diff `cached` against `fresh` by WFM identity.
    pub fn compute(cached: &[T], fresh: &[T]) -> Self {
        let cached_by_id: HashMap<&str, &T> = cached.iter().map(|e| (e.wfm_id(), e)).collect();
        let fresh_ids: HashSet<&str> = fresh.iter().map(|e| e.wfm_id()).collect();

        let mut delta = Self::default();
        let mut seen = HashSet::new();
        for entity in fresh {
            if !seen.insert(entity.wfm_id()) {
                continue;
            }
            match cached_by_id.get(entity.wfm_id()) {
                None => delta.created.push(entity.clone()),
                Some(previous) if !previous.same_content(entity) => {
                    let mut updated = entity.clone();
                    updated.carry_over(previous);
                    delta.updated.push(updated);
                }
                Some(_) => {}
            }
        }
        delta.deleted = cached
            .iter()
            .filter(|e| !fresh_ids.contains(e.wfm_id()))
            .cloned()
            .collect();
        delta
    }

    /// Same as [`DeltaSet::compute`] followed by [`DeltaSet::cap`].
    pub fn compute_capped(cached: &[T], fresh: &[T], max: usize, priority: &[String]) -> Self {
        Self::compute(cached, fresh).cap(max, priority)
    }

    pub fn all_len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all_len() == 0
    }

    /// Keep at most `max` of created ∪ updated ∪ deleted, moving the rest to
    /// `skipped`. Ids in `priority` (the previous pass's skipped set) go first.
    pub fn cap(mut self, max: usize, priority: &[String]) -> Self {
        if self.all_len() <= max {
            return self;
        }
        let priority: HashSet<&str> = priority.iter().map(String::as_str).collect();
        let mut all: Vec<(Bucket, T)> = Vec::with_capacity(self.all_len());
        all.extend(self.created.drain(..).map(|e| (Bucket::Created, e)));
        all.extend(self.updated.drain(..).map(|e| (Bucket::Updated, e)));
        all.extend(self.deleted.drain(..).map(|e| (Bucket::Deleted, e)));
        all.sort_by_key(|(_, e)| !priority.contains(e.wfm_id()));

        for (idx, (bucket, entity)) in all.into_iter().enumerate() {
            if idx >= max {
                self.skipped.push(entity);
                continue;
            }
            match bucket {
                Bucket::Created => self.created.push(entity),
                Bucket::Updated => self.updated.push(entity),
                Bucket::Deleted => self.deleted.push(entity),
            }
        }
        self.has_more = !self.skipped.is_empty();
        self
    }

    /// Move an entity that could not be pushed out of the applied sets.
    pub fn mark_failed(&mut self, wfm_id: &str) {
        for bucket in [&mut self.created, &mut self.updated, &mut self.deleted] {
            if let Some(idx) = bucket.iter().position(|e| e.wfm_id() == wfm_id) {
                let entity = bucket.remove(idx);
                self.failed.push(entity);
                return;
            }
        }
    }

    pub fn skipped_ids(&self) -> Vec<String> {
        self.skipped.iter().map(|e| e.wfm_id().to_string()).collect()
    }

    /// Drop every touched identity from `cached`, then append created and updated.
    pub fn apply(&self, cached: &[T]) -> Vec<T> {
        let touched: HashSet<&str> = self
            .created
            .iter()
            .chain(&self.updated)
            .chain(&self.deleted)
            .map(|e| e.wfm_id())
            .collect();
        cached
            .iter()
            .filter(|e| !touched.contains(e.wfm_id()))
            .cloned()
            .chain(self.created.iter().cloned())
            .chain(self.updated.iter().cloned())
            .collect()
    }
}
