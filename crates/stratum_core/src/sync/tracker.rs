//! # Job Dependency Tracking
//!
//! Per-component-type reader/writer registry that orders jobs touching the
//! same data and lets jobs with disjoint data run in parallel.
//!
//! ## State Machine
//!
//! | State | Meaning |
//! |------:|--------|
//! | `Idle` | no outstanding handle |
//! | `Reading(n)` | `n` outstanding readers, no writer |
//! | `Writing` | one outstanding writer (readers before it are subsumed) |
//!
//! A new reader depends on the current writer. A new writer depends on the
//! current writer and every current reader, then replaces the record with
//! `{ readers: ∅, writer: self }`.
//!
//! ## Violations
//!
//! Touching a type while a conflicting handle is still outstanding is
//! reported as [`StoreError::UnsynchronizedAccess`], never silently raced.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::handle::JobHandle;
use crate::ecs::component::ComponentTypeId;
use crate::error::{AccessKind, StoreError, StoreResult};

/// Declared read and write sets of a job.
///
/// A type in both sets is treated as written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessSet {
    reads: Vec<ComponentTypeId>,
    writes: Vec<ComponentTypeId>,
}

impl AccessSet {
    /// Creates an empty access set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares read access to `type_id`.
    #[must_use]
    pub fn read(mut self, type_id: ComponentTypeId) -> Self {
        if !self.writes.contains(&type_id) {
            insert_sorted(&mut self.reads, type_id);
        }
        self
    }

    /// Declares write access to `type_id`.
    #[must_use]
    pub fn write(mut self, type_id: ComponentTypeId) -> Self {
        self.reads.retain(|&t| t != type_id);
        insert_sorted(&mut self.writes, type_id);
        self
    }

    /// Read-only types.
    #[must_use]
    pub fn reads(&self) -> &[ComponentTypeId] {
        &self.reads
    }

    /// Written types.
    #[must_use]
    pub fn writes(&self) -> &[ComponentTypeId] {
        &self.writes
    }

    /// Checks if `type_id` may be read.
    #[must_use]
    pub fn can_read(&self, type_id: ComponentTypeId) -> bool {
        self.reads.binary_search(&type_id).is_ok() || self.can_write(type_id)
    }

    /// Checks if `type_id` may be written.
    #[must_use]
    pub fn can_write(&self, type_id: ComponentTypeId) -> bool {
        self.writes.binary_search(&type_id).is_ok()
    }

    /// Returns `true` if running both sets concurrently would race:
    /// write/write, write/read or read/write on any type.
    #[must_use]
    pub fn conflicts_with(&self, other: &AccessSet) -> bool {
        self.writes.iter().any(|&t| other.can_read(t)) || other.writes.iter().any(|&t| self.can_read(t))
    }

    /// Checks if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}

fn insert_sorted(list: &mut Vec<ComponentTypeId>, type_id: ComponentTypeId) {
    if let Err(pos) = list.binary_search(&type_id) {
        list.insert(pos, type_id);
    }
}

/// Observable dependency state of one component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyState {
    /// No outstanding handle.
    Idle,
    /// Outstanding readers and no writer.
    Reading(usize),
    /// An outstanding writer.
    Writing,
}

#[derive(Debug, Default)]
struct Record {
    readers: Vec<JobHandle>,
    writer: Option<JobHandle>,
}

impl Record {
    fn prune(&mut self) {
        self.readers.retain(|h| !h.is_complete());
        if self.writer.as_ref().is_some_and(JobHandle::is_complete) {
            self.writer = None;
        }
    }

    fn is_idle(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    /// Outstanding handles a new access of the given kind must wait for.
    fn blockers(&self, write: bool) -> impl Iterator<Item = &JobHandle> {
        let readers: &[JobHandle] = if write { &self.readers } else { &[] };
        self.writer
            .iter()
            .chain(readers)
            .filter(|h| !h.is_complete())
    }
}

/// Per-world registry of outstanding job handles per component type.
///
/// Created with the world and drained when it drops; never shared between
/// worlds.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    records: Mutex<HashMap<ComponentTypeId, Record>>,
}

impl DependencyTracker {
    /// Creates an idle tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job accessing `access` and returns its handle.
    ///
    /// The handle depends on the current writer of every declared type and,
    /// for written types, on every current reader.
    pub fn begin(&self, access: &AccessSet) -> JobHandle {
        let mut records = self.records.lock();
        let mut deps: Vec<JobHandle> = Vec::new();
        for (type_id, write) in declared(access) {
            if let Some(record) = records.get_mut(&type_id) {
                record.prune();
                for blocker in record.blockers(write) {
                    if !deps.contains(blocker) {
                        deps.push(blocker.clone());
                    }
                }
            }
        }
        let handle = JobHandle::pending(deps);
        register(&mut records, access, &handle);
        handle
    }

    /// Registers a job that runs after `dependency` only.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnsynchronizedAccess`] if an outstanding handle that
    /// conflicts with `access` is not covered by `dependency`. Nothing is
    /// registered in that case.
    pub fn begin_after(&self, access: &AccessSet, dependency: &JobHandle) -> StoreResult<JobHandle> {
        let mut records = self.records.lock();
        for (type_id, write) in declared(access) {
            let Some(record) = records.get_mut(&type_id) else {
                continue;
            };
            record.prune();
            if let Some(blocker) = record.blockers(write).find(|h| !dependency.depends_on(h)) {
                return Err(StoreError::UnsynchronizedAccess {
                    type_id,
                    job: blocker.id(),
                    access: if write { AccessKind::Write } else { AccessKind::Read },
                });
            }
        }
        let handle = JobHandle::pending(vec![dependency.clone()]);
        register(&mut records, access, &handle);
        Ok(handle)
    }

    /// Checks that `type_id` can be read outside any job.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnsynchronizedAccess`] naming the outstanding writer.
    pub fn check_read(&self, type_id: ComponentTypeId) -> StoreResult<()> {
        self.check(type_id, AccessKind::Read)
    }

    /// Checks that `type_id` can be written outside any job.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnsynchronizedAccess`] naming an outstanding reader or writer.
    pub fn check_write(&self, type_id: ComponentTypeId) -> StoreResult<()> {
        self.check(type_id, AccessKind::Write)
    }

    /// Checks that every type in `types` is idle, as structural changes require.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnsynchronizedAccess`] naming the first outstanding handle.
    pub fn check_exclusive(&self, types: &[ComponentTypeId]) -> StoreResult<()> {
        types
            .iter()
            .try_for_each(|&type_id| self.check(type_id, AccessKind::Structural))
    }

    fn check(&self, type_id: ComponentTypeId, access: AccessKind) -> StoreResult<()> {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&type_id) else {
            return Ok(());
        };
        record.prune();
        let write = access != AccessKind::Read;
        let blocker = record.blockers(write).next().map(JobHandle::id);
        match blocker {
            Some(job) => Err(StoreError::UnsynchronizedAccess { type_id, job, access }),
            None => Ok(()),
        }
    }

    /// Current state of `type_id`.
    #[must_use]
    pub fn state(&self, type_id: ComponentTypeId) -> DependencyState {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&type_id) else {
            return DependencyState::Idle;
        };
        record.prune();
        match (&record.writer, record.readers.len()) {
            (Some(_), _) => DependencyState::Writing,
            (None, 0) => DependencyState::Idle,
            (None, n) => DependencyState::Reading(n),
        }
    }

    /// Blocks until `handle` and everything it depends on has finished,
    /// then drops completed handles from the registry. Idempotent.
    ///
    /// # Errors
    ///
    /// [`StoreError::JobPanicked`] if the job panicked.
    pub fn complete(&self, handle: &JobHandle) -> StoreResult<()> {
        handle.wait();
        self.prune();
        if handle.panicked() {
            return Err(StoreError::JobPanicked { job: handle.id() });
        }
        Ok(())
    }

    /// Completes every outstanding handle.
    ///
    /// # Errors
    ///
    /// [`StoreError::JobPanicked`] for the first panicked job found; every
    /// handle is still waited for.
    pub fn complete_all(&self) -> StoreResult<()> {
        let outstanding: Vec<JobHandle> = {
            let records = self.records.lock();
            records
                .values()
                .flat_map(|r| r.writer.iter().chain(&r.readers))
                .cloned()
                .collect()
        };
        let mut result = Ok(());
        for handle in &outstanding {
            let outcome = self.complete(handle);
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }

    fn prune(&self) {
        let mut records = self.records.lock();
        records.values_mut().for_each(Record::prune);
        records.retain(|_, r| !r.is_idle());
    }
}

fn declared(access: &AccessSet) -> impl Iterator<Item = (ComponentTypeId, bool)> + '_ {
    access
        .reads()
        .iter()
        .map(|&t| (t, false))
        .chain(access.writes().iter().map(|&t| (t, true)))
}

fn register(records: &mut HashMap<ComponentTypeId, Record>, access: &AccessSet, handle: &JobHandle) {
    for &type_id in access.reads() {
        records.entry(type_id).or_default().readers.push(handle.clone());
    }
    for &type_id in access.writes() {
        let record = records.entry(type_id).or_default();
        record.readers.clear();
        record.writer = Some(handle.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(raw: u32) -> ComponentTypeId {
        ComponentTypeId::from_raw(raw)
    }

    #[test]
    fn test_access_set_normalizes() {
        let set = AccessSet::new().read(ty(2)).write(ty(2)).read(ty(1)).read(ty(2));
        assert_eq!(set.reads(), &[ty(1)]);
        assert_eq!(set.writes(), &[ty(2)]);
        assert!(set.can_read(ty(2)));
        assert!(!set.can_write(ty(1)));
    }

    #[test]
    fn test_conflicts() {
        let read_a = AccessSet::new().read(ty(0));
        let read_a2 = AccessSet::new().read(ty(0));
        let write_a = AccessSet::new().write(ty(0));
        let write_b = AccessSet::new().write(ty(1));
        assert!(!read_a.conflicts_with(&read_a2));
        assert!(read_a.conflicts_with(&write_a));
        assert!(write_a.conflicts_with(&read_a));
        assert!(!write_a.conflicts_with(&write_b));
    }

    #[test]
    fn test_readers_do_not_depend_on_each_other() {
        let tracker = DependencyTracker::new();
        let a = tracker.begin(&AccessSet::new().read(ty(0)));
        let b = tracker.begin(&AccessSet::new().read(ty(0)));
        assert!(b.dependencies().is_empty());
        assert_eq!(tracker.state(ty(0)), DependencyState::Reading(2));
        a.signal(false);
        b.signal(false);
        assert_eq!(tracker.state(ty(0)), DependencyState::Idle);
    }

    #[test]
    fn test_writer_depends_on_readers_and_replaces_them() {
        let tracker = DependencyTracker::new();
        let r1 = tracker.begin(&AccessSet::new().read(ty(0)));
        let r2 = tracker.begin(&AccessSet::new().read(ty(0)));
        let w = tracker.begin(&AccessSet::new().write(ty(0)));
        assert!(w.depends_on(&r1));
        assert!(w.depends_on(&r2));
        assert_eq!(tracker.state(ty(0)), DependencyState::Writing);

        let r3 = tracker.begin(&AccessSet::new().read(ty(0)));
        assert_eq!(r3.dependencies(), vec![w.clone()]);
    }

    #[test]
    fn test_disjoint_writers_are_independent() {
        let tracker = DependencyTracker::new();
        let a = tracker.begin(&AccessSet::new().write(ty(0)));
        let b = tracker.begin(&AccessSet::new().write(ty(1)));
        assert!(!b.depends_on(&a));
    }

    #[test]
    fn test_access_checks() {
        let tracker = DependencyTracker::new();
        let reader = tracker.begin(&AccessSet::new().read(ty(0)));
        assert!(tracker.check_read(ty(0)).is_ok());
        assert_eq!(
            tracker.check_write(ty(0)),
            Err(StoreError::UnsynchronizedAccess {
                type_id: ty(0),
                job: reader.id(),
                access: AccessKind::Write,
            })
        );
        assert!(matches!(
            tracker.check_exclusive(&[ty(1), ty(0)]),
            Err(StoreError::UnsynchronizedAccess { access: AccessKind::Structural, .. })
        ));
        reader.signal(false);
        assert!(tracker.check_exclusive(&[ty(0)]).is_ok());
    }

    #[test]
    fn test_begin_after_requires_coverage() {
        let tracker = DependencyTracker::new();
        let writer = tracker.begin(&AccessSet::new().write(ty(0)));
        let unrelated = tracker.begin(&AccessSet::new().write(ty(1)));

        let err = tracker
            .begin_after(&AccessSet::new().read(ty(0)), &unrelated)
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::UnsynchronizedAccess {
                type_id: ty(0),
                job: writer.id(),
                access: AccessKind::Read,
            }
        );

        let covering = JobHandle::combine(&[writer.clone(), unrelated.clone()]);
        let reader = tracker
            .begin_after(&AccessSet::new().read(ty(0)), &covering)
            .unwrap();
        assert!(reader.depends_on(&writer));
    }

    #[test]
    fn test_complete_is_idempotent() {
        let tracker = DependencyTracker::new();
        let handle = tracker.begin(&AccessSet::new().write(ty(0)));
        handle.signal(false);
        assert!(tracker.complete(&handle).is_ok());
        assert!(tracker.complete(&handle).is_ok());
        assert_eq!(tracker.state(ty(0)), DependencyState::Idle);
    }

    #[test]
    fn test_complete_reports_panics() {
        let tracker = DependencyTracker::new();
        let handle = tracker.begin(&AccessSet::new().write(ty(0)));
        handle.signal(true);
        assert_eq!(
            tracker.complete(&handle),
            Err(StoreError::JobPanicked { job: handle.id() })
        );
        assert!(tracker.complete_all().is_ok());
    }
}
